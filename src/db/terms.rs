use async_trait::async_trait;
use tracing::instrument;

use super::core::Database;
use crate::error::StoreError;
use crate::store::{RecordId, TermStore};

#[async_trait]
impl TermStore for Database {
    #[instrument(target = "db", level = "debug", skip(self))]
    async fn terms_for(&self, ids: &[RecordId]) -> Result<Vec<(String, String)>, StoreError> {
        let mut terms = Vec::new();
        for id in ids {
            let rows = sqlx::query_as::<_, (String, String)>(
                "SELECT taxonomy, term FROM record_terms WHERE record_id = ?1 ORDER BY rowid",
            )
            .bind(id)
            .fetch_all(self.pool())
            .await?;

            for row in rows {
                if !terms.contains(&row) {
                    terms.push(row);
                }
            }
        }
        Ok(terms)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    async fn assign_term(
        &self,
        id: RecordId,
        taxonomy: &str,
        term: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO record_terms (record_id, taxonomy, term) VALUES (?1, ?2, ?3)
            ON CONFLICT(record_id, taxonomy, term) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(taxonomy)
        .bind(term)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
