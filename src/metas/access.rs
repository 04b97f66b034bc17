use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::registry::{
    fields, DescriptorError, FieldDescriptor, FieldRegistry, Level, UseContext, CURATION_LEVELS,
    MASTER_FIELD,
};
use crate::error::StoreError;
use crate::store::{is_empty_value, Ports, RecordId, TAXONOMY_FEED_CATEGORY, TAXONOMY_POST_TAG};
use crate::TARGET_DB;

/// Placeholder author some feeds emit in place of a real byline.
const AGGREGATION_AUTHOR: &str = "aggregation";

/// Site-wide default for forwarding readers to the origin of a link.
pub const OPTION_LINK_TO_SOURCE: &str = "pf_link_to_source";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteMode {
    /// Insert if absent, otherwise overwrite.
    Add,
    Update,
}

/// What [`MetaAccess::copy_all_between`] moved onto the destination.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub fields: Vec<String>,
    pub terms: Vec<(String, String)>,
}

/// Reads and writes record metadata through the field registry.
///
/// Operations on one record are serialized by a per-record lock, so two writers
/// updating different members of the `pf_meta` container never lose each other's
/// change.
pub struct MetaAccess {
    ports: Ports,
    registry: Arc<FieldRegistry>,
    locks: DashMap<RecordId, Arc<Mutex<()>>>,
}

impl MetaAccess {
    pub fn new(ports: Ports) -> Self {
        Self::with_registry(ports, Arc::new(FieldRegistry::standard().clone()))
    }

    pub fn with_registry(ports: Ports, registry: Arc<FieldRegistry>) -> Self {
        Self {
            ports,
            registry,
            locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    async fn lock(&self, id: RecordId) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    /// Reads a field, migrating deprecated and standalone legacy values as it goes
    /// and applying the computed fallbacks for `item_link`, `source_title` and
    /// `item_author`.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn read(&self, id: RecordId, field: &str) -> Result<Option<Value>, StoreError> {
        let _guard = self.lock(id).await;
        let descriptor = self.resolve(id, field).await?;
        let value = self.stored(id, &descriptor).await?;
        self.with_fallback(id, &descriptor.name, value).await
    }

    /// Reads a field as stored, without computed fallbacks.
    pub async fn read_stored(&self, id: RecordId, field: &str) -> Result<Option<Value>, StoreError> {
        let _guard = self.lock(id).await;
        let descriptor = self.resolve(id, field).await?;
        self.stored(id, &descriptor).await
    }

    /// Writes a field, inserting it if absent and overwriting it otherwise.
    #[instrument(target = "db", level = "debug", skip(self, value))]
    pub async fn write(&self, id: RecordId, field: &str, value: Value) -> Result<bool, StoreError> {
        let _guard = self.lock(id).await;
        let descriptor = self.resolve(id, field).await?;
        self.put(id, &descriptor, value, WriteMode::Add).await
    }

    /// Overwrites a field.
    #[instrument(target = "db", level = "debug", skip(self, value))]
    pub async fn update(&self, id: RecordId, field: &str, value: Value) -> Result<bool, StoreError> {
        let _guard = self.lock(id).await;
        let descriptor = self.resolve(id, field).await?;
        self.put(id, &descriptor, value, WriteMode::Update).await
    }

    /// Writes a batch of fields.
    pub async fn establish(&self, id: RecordId, entries: Vec<(&str, Value)>) -> Result<(), StoreError> {
        for (field, value) in entries {
            self.write(id, field, value).await?;
        }
        Ok(())
    }

    /// Every stored meta on a record, with the container's members unwrapped.
    pub async fn read_all(&self, id: RecordId) -> Result<BTreeMap<String, Value>, StoreError> {
        let _guard = self.lock(id).await;
        let mut all = self.ports.metas.all_metas(id).await?;
        if let Some(Value::Object(container)) = all.remove(MASTER_FIELD) {
            all.extend(container);
        }
        Ok(all)
    }

    /// Fields visible in `context` at the record's level, with fallbacks applied.
    pub async fn attach_by_use(
        &self,
        id: RecordId,
        context: UseContext,
    ) -> Result<BTreeMap<String, Value>, StoreError> {
        let record = self
            .ports
            .records
            .get_record(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("record {}", id)))?;

        let names: Vec<String> = self
            .registry
            .visible_at(context, Level::for_kind(record.kind))
            .into_iter()
            .map(|d| d.name.clone())
            .collect();

        let mut attached = BTreeMap::new();
        for name in names {
            if let Some(value) = self.read(id, &name).await? {
                attached.insert(name, value);
            }
        }
        Ok(attached)
    }

    /// Copies every curation-level field from one record to another.
    ///
    /// Canonical values win over deprecated ones. Empty values are skipped. With
    /// `with_terms`, taxonomy assignments and `item_tags` cascade as well.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn copy_all_between(
        &self,
        source: RecordId,
        dest: RecordId,
        with_terms: bool,
    ) -> Result<CopySummary, StoreError> {
        let mut summary = CopySummary::default();

        for descriptor in self.registry.describe_all() {
            if descriptor.name == MASTER_FIELD || !descriptor.applies_to_any(CURATION_LEVELS) {
                continue;
            }

            let (target, value) = match (descriptor.deprecated, descriptor.replacement_name) {
                (true, Some(replacement)) => {
                    let canonical = self.read_stored(source, replacement).await?;
                    if !is_empty_value(canonical.as_ref()) {
                        continue;
                    }
                    let legacy = {
                        let _guard = self.lock(source).await;
                        self.legacy_value(source, &descriptor.name).await?
                    };
                    (replacement.to_string(), legacy)
                }
                (true, None) => continue,
                (false, _) => (
                    descriptor.name.clone(),
                    self.read_stored(source, &descriptor.name).await?,
                ),
            };

            let Some(value) = value.filter(|v| !is_empty_value(Some(v))) else {
                continue;
            };
            self.write(dest, &target, value).await?;
            summary.fields.push(target);
        }

        if with_terms {
            summary.terms = self.transition_terms(source, dest).await?;
        }

        debug!(
            target: TARGET_DB,
            "Copied {} fields and {} terms from {} to {}",
            summary.fields.len(),
            summary.terms.len(),
            source,
            dest
        );
        Ok(summary)
    }

    /// Whether readers of a post should be forwarded to the original link.
    pub async fn forward_to_origin_status(&self, id: RecordId) -> Result<String, StoreError> {
        let item_id = self.read(id, fields::ITEM_ID).await?;
        if is_empty_value(item_id.as_ref()) {
            return Ok("no-forward".to_string());
        }

        let value = self.read(id, fields::FORWARD_TO_ORIGIN).await?;
        if let Some(value) = value.filter(|v| !is_empty_value(Some(v))) {
            return Ok(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }

        let site_default = self.ports.options.get_option(OPTION_LINK_TO_SOURCE).await?;
        Ok(if is_empty_value(site_default.as_ref()) {
            "no-forward".to_string()
        } else {
            "forward".to_string()
        })
    }

    async fn transition_terms(
        &self,
        source: RecordId,
        dest: RecordId,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let mut sources = vec![source];
        if let Some(parent) = self
            .ports
            .records
            .get_record(source)
            .await?
            .and_then(|r| r.parent_id)
        {
            sources.push(parent);
        }
        if let Some(linked) = self
            .read_stored(source, fields::ITEM_POST_ID)
            .await?
            .as_ref()
            .and_then(as_record_id)
        {
            if !sources.contains(&linked) {
                sources.push(linked);
            }
        }

        let mut assigned = Vec::new();
        for (taxonomy, term) in self.ports.terms.terms_for(&sources).await? {
            self.ports.terms.assign_term(dest, &taxonomy, &term).await?;
            if taxonomy == TAXONOMY_FEED_CATEGORY {
                self.ports.terms.assign_term(dest, TAXONOMY_POST_TAG, &term).await?;
                assigned.push((TAXONOMY_POST_TAG.to_string(), term.clone()));
            }
            assigned.push((taxonomy, term));
        }

        let item_tags = self.read_stored(source, fields::ITEM_TAGS).await?;
        for tag in split_tags(item_tags.as_ref()) {
            self.ports.terms.assign_term(dest, TAXONOMY_POST_TAG, &tag).await?;
            assigned.push((TAXONOMY_POST_TAG.to_string(), tag));
        }

        Ok(assigned)
    }

    /// Resolves a name and, when it is deprecated, migrates the legacy value.
    /// Caller holds the record lock.
    async fn resolve(&self, id: RecordId, field: &str) -> Result<FieldDescriptor, StoreError> {
        let descriptor = self.registry.resolve_canonical(field);
        match descriptor.error {
            Some(DescriptorError::NotRegistered) => {
                debug!(target: TARGET_DB, "{} is not a registered field; using it as a raw key", field);
            }
            Some(DescriptorError::BrokenReplacement) => {
                warn!(target: TARGET_DB, "Deprecated field {} has no usable replacement", field);
            }
            None => {}
        }

        if descriptor.name != field {
            self.migrate_deprecated(id, field, &descriptor).await?;
        }
        Ok(descriptor)
    }

    async fn migrate_deprecated(
        &self,
        id: RecordId,
        old: &str,
        canonical: &FieldDescriptor,
    ) -> Result<(), StoreError> {
        let Some(legacy) = self.legacy_value(id, old).await? else {
            return Ok(());
        };

        if !is_empty_value(Some(&legacy)) {
            let current = self.stored(id, canonical).await?;
            if is_empty_value(current.as_ref()) {
                self.put(id, canonical, legacy, WriteMode::Add).await?;
                info!(target: TARGET_DB, "Migrated {} to {} on record {}", old, canonical.name, id);
            }
        }

        self.ports.metas.delete_meta(id, old).await?;
        let mut container = self.container(id).await?;
        if container.remove(old).is_some() {
            self.save_container(id, container).await?;
        }
        Ok(())
    }

    /// A deprecated field's value, whether standalone or inside the container.
    async fn legacy_value(&self, id: RecordId, old: &str) -> Result<Option<Value>, StoreError> {
        if let Some(value) = self.ports.metas.get_meta(id, old).await? {
            return Ok(Some(value));
        }
        Ok(self.container(id).await?.remove(old))
    }

    async fn stored(
        &self,
        id: RecordId,
        descriptor: &FieldDescriptor,
    ) -> Result<Option<Value>, StoreError> {
        if descriptor.is_bagged() {
            self.read_bagged(id, &descriptor.name).await
        } else {
            self.ports.metas.get_meta(id, &descriptor.name).await
        }
    }

    /// Reads a container member, moving a standalone value into the container the
    /// first time one is found.
    async fn read_bagged(&self, id: RecordId, key: &str) -> Result<Option<Value>, StoreError> {
        let mut container = self.container(id).await?;
        if let Some(value) = container.get(key) {
            return Ok(Some(value.clone()));
        }

        let Some(standalone) = self.ports.metas.get_meta(id, key).await? else {
            return Ok(None);
        };
        container.insert(key.to_string(), standalone.clone());
        self.save_container(id, container).await?;
        self.ports.metas.delete_meta(id, key).await?;
        debug!(target: TARGET_DB, "Moved standalone {} into {} on record {}", key, MASTER_FIELD, id);
        Ok(Some(standalone))
    }

    async fn put(
        &self,
        id: RecordId,
        descriptor: &FieldDescriptor,
        value: Value,
        mode: WriteMode,
    ) -> Result<bool, StoreError> {
        let value = normalize(&descriptor.name, value);

        if descriptor.name == fields::FEED_ITEM_WORD_COUNT {
            self.advance_word_count(id, &value).await?;
        }

        if descriptor.is_bagged() {
            let mut container = self.container(id).await?;
            if container.get(&descriptor.name) == Some(&value) {
                return Ok(false);
            }
            container.insert(descriptor.name.clone(), value);
            return self.save_container(id, container).await;
        }

        match mode {
            WriteMode::Add => self.upsert(id, &descriptor.name, &value).await,
            WriteMode::Update => self.ports.metas.update_meta(id, &descriptor.name, &value).await,
        }
    }

    /// The latest word count only moves up.
    async fn advance_word_count(&self, id: RecordId, value: &Value) -> Result<(), StoreError> {
        let Some(incoming) = as_number(value) else {
            return Ok(());
        };
        let latest = self.ports.metas.get_meta(id, fields::WORD_COUNT).await?;
        let advance = is_empty_value(latest.as_ref())
            || latest.as_ref().and_then(as_number).map_or(true, |l| incoming > l);
        if advance {
            self.upsert(id, fields::WORD_COUNT, value).await?;
        }
        Ok(())
    }

    async fn with_fallback(
        &self,
        id: RecordId,
        name: &str,
        value: Option<Value>,
    ) -> Result<Option<Value>, StoreError> {
        let needs_fallback = match name {
            fields::ITEM_LINK | fields::SOURCE_TITLE => is_empty_value(value.as_ref()),
            fields::ITEM_AUTHOR => {
                is_empty_value(value.as_ref())
                    || value.as_ref().and_then(Value::as_str) == Some(AGGREGATION_AUTHOR)
            }
            _ => false,
        };
        if !needs_fallback {
            return Ok(value);
        }

        let Some(record) = self.ports.records.get_record(id).await? else {
            return Ok(value);
        };

        let fallback = match name {
            fields::ITEM_LINK => Some(Value::String(record.guid)).filter(|v| !is_empty_value(Some(v))),
            fields::SOURCE_TITLE => match record.parent_id {
                Some(parent) => self
                    .ports
                    .records
                    .get_record(parent)
                    .await?
                    .map(|feed| Value::String(feed.title))
                    .filter(|v| !is_empty_value(Some(v))),
                None => None,
            },
            _ => self
                .ports
                .metas
                .get_meta(record.parent_id.unwrap_or(id), fields::FEED_DEFAULT_AUTHOR)
                .await?
                .filter(|v| !is_empty_value(Some(v))),
        };

        Ok(fallback.or(value))
    }

    async fn container(&self, id: RecordId) -> Result<Map<String, Value>, StoreError> {
        match self.ports.metas.get_meta(id, MASTER_FIELD).await? {
            Some(Value::Object(container)) => Ok(container),
            Some(Value::Null) | None => Ok(Map::new()),
            Some(other) => {
                warn!(target: TARGET_DB, "Discarding malformed {} on record {}: {}", MASTER_FIELD, id, other);
                Ok(Map::new())
            }
        }
    }

    async fn save_container(&self, id: RecordId, container: Map<String, Value>) -> Result<bool, StoreError> {
        self.upsert(id, MASTER_FIELD, &Value::Object(container)).await
    }

    async fn upsert(&self, id: RecordId, key: &str, value: &Value) -> Result<bool, StoreError> {
        if self.ports.metas.add_meta(id, key, value).await? {
            return Ok(true);
        }
        self.ports.metas.update_meta(id, key, value).await
    }
}

fn normalize(name: &str, value: Value) -> Value {
    match (name, value) {
        (fields::ITEM_AUTHOR, Value::String(author)) => Value::String(author.trim().to_string()),
        (_, value) => value,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_record_id(value: &Value) -> Option<RecordId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn split_tags(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}
