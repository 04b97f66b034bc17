//! HTTP surface of the retrieval service: the self-trigger endpoint that keeps a
//! cycle moving, plus admin routes for status, reset and single-feed retrieval.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::{RetrievalError, StoreError};
use crate::metas::{ApiRegistration, FieldDescriptor, FieldRegistry, UseContext};
use crate::retrieval::{IngestOutcome, Scheduler, StatusReport, StepOutcome, TickOutcome};
use crate::store::RecordId;
use crate::TARGET_WEB_REQUEST;

type AppState = Arc<Scheduler>;

/// Query of the self-trigger request, `/?press=forward&nonce=...`.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    press: Option<String>,
    nonce: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FieldParams {
    context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FieldListing {
    pub fields: Vec<FieldDescriptor>,
    pub registrations: Vec<ApiRegistration>,
}

#[derive(Debug, Serialize)]
pub struct FeedCheck {
    pub feed_id: RecordId,
    pub is_feed: bool,
}

pub fn router(scheduler: AppState) -> Router {
    Router::new()
        .route("/", get(self_trigger))
        .route("/retrieval/tick", post(tick))
        .route("/retrieval/reset", post(reset))
        .route("/retrieval/status", get(status))
        .route("/feeds/{id}/retrieve", post(retrieve_feed))
        .route("/feeds/{id}/check", get(check_feed))
        .route("/fields", get(fields))
        .with_state(scheduler)
}

/// Serves the API until the process ends.
pub async fn api_loop(scheduler: AppState, bind_address: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;
    info!(target: TARGET_WEB_REQUEST, "Server running on http://{}", addr);

    axum::serve(listener, router(scheduler).into_make_service()).await?;
    Ok(())
}

/// Runs one chunk for a request carrying the current chunk token.
async fn self_trigger(
    State(scheduler): State<AppState>,
    Query(params): Query<TriggerParams>,
) -> Result<Json<StepOutcome>, StatusCode> {
    if params.press.as_deref() != Some("forward") {
        return Err(StatusCode::NOT_FOUND);
    }
    let Some(nonce) = params.nonce.filter(|n| !n.is_empty()) else {
        warn!(target: TARGET_WEB_REQUEST, "Self-trigger request without a nonce");
        return Err(StatusCode::FORBIDDEN);
    };

    match scheduler.step_with_token(&nonce).await {
        Ok(Some(step)) => {
            debug!(target: TARGET_WEB_REQUEST, "Self-trigger ran a chunk: {:?}", step);
            Ok(Json(step))
        }
        Ok(None) => {
            warn!(target: TARGET_WEB_REQUEST, "Self-trigger request with an invalid nonce");
            Err(StatusCode::FORBIDDEN)
        }
        Err(err) => Err(store_failure("self_trigger", err)),
    }
}

/// The timer tick on demand. A chunk that leaves the cycle running hands off to
/// `advance_feeds` in the background.
async fn tick(State(scheduler): State<AppState>) -> Json<TickOutcome> {
    let outcome = scheduler.trigger_source_data().await;
    if outcome.step().is_some_and(StepOutcome::continues_cycle) {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler.advance_feeds().await;
        });
    }
    Json(outcome)
}

async fn reset(State(scheduler): State<AppState>) -> Result<StatusCode, StatusCode> {
    scheduler
        .feed_retrieval_reset()
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| store_failure("reset", err))
}

async fn status(State(scheduler): State<AppState>) -> Result<Json<StatusReport>, StatusCode> {
    scheduler
        .status()
        .await
        .map(Json)
        .map_err(|err| store_failure("status", err))
}

async fn retrieve_feed(
    State(scheduler): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<IngestOutcome>, StatusCode> {
    info!(target: TARGET_WEB_REQUEST, "Retrieval requested for feed {}", id);
    scheduler
        .retrieve_feed(id)
        .await
        .map(Json)
        .map_err(|err| retrieval_failure("retrieve_feed", err))
}

async fn check_feed(
    State(scheduler): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<FeedCheck>, StatusCode> {
    scheduler
        .is_feed(id)
        .await
        .map(|is_feed| Json(FeedCheck { feed_id: id, is_feed }))
        .map_err(|err| retrieval_failure("check_feed", err))
}

/// The field registry, filtered to one use context when `context` is given.
async fn fields(
    State(scheduler): State<AppState>,
    Query(params): Query<FieldParams>,
) -> Result<Json<FieldListing>, StatusCode> {
    let registry: &FieldRegistry = scheduler.metas().registry();
    let context = match params.context.as_deref() {
        None => None,
        Some("api") => Some(UseContext::Api),
        Some("admin") => Some(UseContext::Admin),
        Some(other) => {
            debug!(target: TARGET_WEB_REQUEST, "Unknown field context {}", other);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let fields = match context {
        Some(context) => {
            let visible = registry.keys_visible_in(context);
            registry
                .describe_all()
                .iter()
                .filter(|d| visible.contains(&d.name))
                .cloned()
                .collect()
        }
        None => registry.describe_all().to_vec(),
    };

    Ok(Json(FieldListing {
        fields,
        registrations: registry.api_registrations(),
    }))
}

fn store_failure(route: &str, err: StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(what) => {
            debug!(target: TARGET_WEB_REQUEST, "web::{} not found: {}", route, what);
            StatusCode::NOT_FOUND
        }
        other => {
            warn!(target: TARGET_WEB_REQUEST, "web::{} storage error: {}", route, other);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn retrieval_failure(route: &str, err: RetrievalError) -> StatusCode {
    match err {
        RetrievalError::Store(err) => store_failure(route, err),
        RetrievalError::NoModule(kind) => {
            warn!(target: TARGET_WEB_REQUEST, "web::{} no module for kind {}", route, kind);
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RetrievalError::Fetch(err) => {
            warn!(target: TARGET_WEB_REQUEST, "web::{} fetch failed: {}", route, err);
            StatusCode::BAD_GATEWAY
        }
        RetrievalError::Random => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::db::Database;
    use crate::retrieval::ModuleRegistry;
    use crate::store::Ports;

    async fn scheduler() -> AppState {
        let db = Arc::new(Database::in_memory().await.unwrap());
        Arc::new(Scheduler::new(
            RetrievalConfig::default(),
            Ports::from_backend(db),
            ModuleRegistry::new(),
        ))
    }

    fn params(press: Option<&str>, nonce: Option<&str>) -> Query<TriggerParams> {
        Query(TriggerParams {
            press: press.map(str::to_string),
            nonce: nonce.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_self_trigger_rejects_missing_and_forged_nonces() {
        let scheduler = scheduler().await;

        let missing = self_trigger(State(scheduler.clone()), params(Some("forward"), None)).await;
        assert_eq!(missing.unwrap_err(), StatusCode::FORBIDDEN);

        let forged = self_trigger(State(scheduler.clone()), params(Some("forward"), Some("abc"))).await;
        assert_eq!(forged.unwrap_err(), StatusCode::FORBIDDEN);

        let other = self_trigger(State(scheduler), params(None, Some("abc"))).await;
        assert_eq!(other.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_self_trigger_runs_a_chunk_with_a_valid_nonce() {
        let scheduler = scheduler().await;
        let nonce = scheduler.tokens().issue().await.unwrap();

        let Json(step) = self_trigger(State(scheduler.clone()), params(Some("forward"), Some(&nonce)))
            .await
            .unwrap();
        assert_eq!(step, StepOutcome::NoFeeds);

        let replay = self_trigger(State(scheduler), params(Some("forward"), Some(&nonce))).await;
        assert_eq!(replay.unwrap_err(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_retrieve_unknown_feed_is_not_found() {
        let scheduler = scheduler().await;
        let result = retrieve_feed(State(scheduler), Path(404)).await;
        assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fields_by_context() {
        let scheduler = scheduler().await;
        let Json(all) = fields(State(scheduler.clone()), Query(FieldParams::default()))
            .await
            .unwrap();
        let Json(api) = fields(
            State(scheduler.clone()),
            Query(FieldParams {
                context: Some("api".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(api.fields.len() < all.fields.len());
        assert!(api.fields.iter().all(|d| d.api_visible));

        let bad = fields(
            State(scheduler),
            Query(FieldParams {
                context: Some("cron".to_string()),
            }),
        )
        .await;
        assert_eq!(bad.unwrap_err(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_and_reset() {
        let scheduler = scheduler().await;
        assert_eq!(reset(State(scheduler.clone())).await.unwrap(), StatusCode::NO_CONTENT);
        let Json(report) = status(State(scheduler)).await.unwrap();
        assert!(report.cursor.is_idle());
        assert!(report.heartbeat.is_none());
    }
}
