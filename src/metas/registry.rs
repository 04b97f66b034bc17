//! Declarative catalog of every metadata field the aggregator recognizes.
//!
//! Each field has a storage shape (a standalone scalar entry, or a member of the
//! serialized `pf_meta` container), the record levels it applies to, and the
//! contexts allowed to read it. Deprecated fields point at exactly one canonical
//! replacement.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::store::RecordKind;

/// Name of the serialized container that holds every bagged field.
pub const MASTER_FIELD: &str = "pf_meta";

/// Names of the fields the retrieval core reads or writes directly.
pub mod fields {
    pub const ITEM_ID: &str = "item_id";
    pub const ITEM_POST_ID: &str = "pf_item_post_id";
    pub const SOURCE_TITLE: &str = "source_title";
    pub const SOURCE_LINK: &str = "pf_source_link";
    pub const ITEM_DATE: &str = "item_date";
    pub const ITEM_AUTHOR: &str = "item_author";
    pub const ITEM_LINK: &str = "item_link";
    pub const ITEM_FEAT_IMG: &str = "item_feat_img";
    pub const ITEM_WP_DATE: &str = "item_wp_date";
    pub const ITEM_TAGS: &str = "item_tags";
    pub const SOURCE_REPEAT: &str = "source_repeat";
    pub const NOMINATION_COUNT: &str = "nomination_count";
    pub const SORTABLE_ITEM_DATE: &str = "sortable_item_date";
    pub const REVERTIBLE_FEED_TEXT: &str = "revertible_feed_text";
    pub const FEED_ITEM_WORD_COUNT: &str = "pf_feed_item_word_count";
    pub const WORD_COUNT: &str = "pf_word_count";
    pub const ARCHIVE: &str = "pf_archive";
    pub const FEED_ERROR_COUNT: &str = "pf_feed_error_count";
    pub const FORWARD_TO_ORIGIN: &str = "pf_forward_to_origin";
    pub const FEED_LAST_RETRIEVED: &str = "pf_feed_last_retrieved";
    pub const FEED_DEFAULT_AUTHOR: &str = "pf_feed_default_author";
    pub const FEED_URL: &str = "feedUrl";
    pub const FEED_LAST_CHECKED: &str = "pf_feed_last_checked";
    pub const NO_FEED_ALERT: &str = "pf_no_feed_alert";
    pub const FEED_TYPE: &str = "feed_type";
    pub const HTML_URL: &str = "htmlUrl";
    pub const USER_ADDED: &str = "user_added";
    pub const MODULE_ADDED: &str = "module_added";
    pub const ALERT_MESSAGE: &str = "ab_alert_msg";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// A standalone meta entry.
    Scalar,
    /// A member of the `pf_meta` container.
    Bagged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Feed,
    Item,
    Nomination,
    Post,
}

impl Level {
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Feed => Level::Feed,
            RecordKind::Item => Level::Item,
            RecordKind::Nomination => Level::Nomination,
            RecordKind::Post => Level::Post,
        }
    }
}

/// Levels that take part in moving an item through curation.
pub const CURATION_LEVELS: &[Level] = &[Level::Item, Level::Nomination, Level::Post];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseContext {
    Admin,
    Api,
}

/// Why a descriptor returned by [`FieldRegistry::resolve_canonical`] is a stand-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorError {
    /// The name is not part of the registry.
    NotRegistered,
    /// The name is deprecated but its replacement could not be resolved.
    BrokenReplacement,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub title: &'static str,
    pub description: &'static str,
    pub storage_kind: StorageKind,
    pub levels: &'static [Level],
    pub deprecated: bool,
    pub replacement_name: Option<&'static str>,
    pub api_visible: bool,
    pub admin_only: bool,
    pub required: bool,
    pub error: Option<DescriptorError>,
}

impl FieldDescriptor {
    /// A scalar stand-in carrying the caller's name so the miss can be logged.
    pub fn stand_in(name: &str, error: DescriptorError) -> Self {
        Self {
            name: name.to_string(),
            title: "",
            description: "",
            storage_kind: StorageKind::Scalar,
            levels: &[Level::Feed, Level::Item, Level::Nomination, Level::Post],
            deprecated: false,
            replacement_name: None,
            api_visible: false,
            admin_only: false,
            required: false,
            error: Some(error),
        }
    }

    pub fn applies_to(&self, level: Level) -> bool {
        self.levels.contains(&level)
    }

    pub fn applies_to_any(&self, levels: &[Level]) -> bool {
        levels.iter().any(|level| self.applies_to(*level))
    }

    pub fn is_bagged(&self) -> bool {
        self.storage_kind == StorageKind::Bagged
    }

    fn visible_in(&self, context: UseContext) -> bool {
        if self.deprecated || !self.api_visible {
            return false;
        }
        match context {
            UseContext::Admin => true,
            UseContext::Api => !self.admin_only,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("field {0} is registered more than once")]
    DuplicateName(String),

    #[error("deprecated field {0} has no replacement")]
    MissingReplacement(String),

    #[error("deprecated field {0} points at unknown field {1}")]
    UnknownReplacement(String, String),

    #[error("deprecated field {0} points at {1}, which is itself deprecated")]
    ChainedDeprecation(String, String),
}

/// A scalar or API entry in the REST registration list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiRegistration {
    pub name: String,
    pub levels: &'static [Level],
    pub description: &'static str,
}

#[derive(Clone, Debug)]
pub struct FieldRegistry {
    descriptors: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
}

static STANDARD: Lazy<FieldRegistry> = Lazy::new(|| {
    FieldRegistry::new(standard_structure()).expect("standard field structure is consistent")
});

impl FieldRegistry {
    /// Builds a registry and checks its invariants.
    pub fn new(descriptors: Vec<FieldDescriptor>) -> Result<Self, Vec<RegistryError>> {
        let mut index = HashMap::with_capacity(descriptors.len());
        let mut errors = Vec::new();

        for (position, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.name.clone(), position).is_some() {
                errors.push(RegistryError::DuplicateName(descriptor.name.clone()));
            }
        }

        let registry = Self { descriptors, index };
        errors.extend(registry.validate());

        if errors.is_empty() {
            Ok(registry)
        } else {
            Err(errors)
        }
    }

    /// The process-wide standard catalog.
    pub fn standard() -> &'static FieldRegistry {
        &STANDARD
    }

    /// The standard catalog plus extra fields, as contributed by extensions.
    pub fn with_extra(extra: Vec<FieldDescriptor>) -> Result<Self, Vec<RegistryError>> {
        let mut descriptors = standard_structure();
        descriptors.extend(extra);
        Self::new(descriptors)
    }

    /// Deprecation must be exactly one hop onto a live field.
    fn validate(&self) -> Vec<RegistryError> {
        let mut errors = Vec::new();
        for descriptor in self.descriptors.iter().filter(|d| d.deprecated) {
            let Some(replacement) = descriptor.replacement_name else {
                errors.push(RegistryError::MissingReplacement(descriptor.name.clone()));
                continue;
            };
            match self.get(replacement) {
                None => errors.push(RegistryError::UnknownReplacement(
                    descriptor.name.clone(),
                    replacement.to_string(),
                )),
                Some(target) if target.deprecated => errors.push(
                    RegistryError::ChainedDeprecation(
                        descriptor.name.clone(),
                        replacement.to_string(),
                    ),
                ),
                Some(_) => {}
            }
        }
        errors
    }

    /// Every descriptor in declaration order.
    pub fn describe_all(&self) -> &[FieldDescriptor] {
        &self.descriptors
    }

    /// Looks a name up exactly, deprecated or not.
    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|position| &self.descriptors[*position])
    }

    /// Resolves a name to the descriptor that owns its storage.
    ///
    /// Deprecated names follow exactly one hop to their replacement. Unknown names
    /// yield a stand-in tagged with [`DescriptorError::NotRegistered`].
    pub fn resolve_canonical(&self, name: &str) -> FieldDescriptor {
        match self.get(name) {
            Some(descriptor) if descriptor.deprecated => {
                match descriptor.replacement_name.and_then(|r| self.get(r)) {
                    Some(target) if !target.deprecated => target.clone(),
                    _ => FieldDescriptor::stand_in(name, DescriptorError::BrokenReplacement),
                }
            }
            Some(descriptor) => descriptor.clone(),
            None => {
                debug!("{} is not a registered field", name);
                FieldDescriptor::stand_in(name, DescriptorError::NotRegistered)
            }
        }
    }

    pub fn all_keys(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    /// Names readable in `context`. Admin sees admin-only fields; the API does not.
    pub fn keys_visible_in(&self, context: UseContext) -> BTreeSet<String> {
        self.descriptors
            .iter()
            .filter(|d| d.visible_in(context))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Descriptors readable in `context` that apply to `level`, in declaration order.
    pub fn visible_at(&self, context: UseContext, level: Level) -> Vec<&FieldDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.visible_in(context) && d.applies_to(level))
            .collect()
    }

    /// Scalar, API-visible fields that an API layer should register per level.
    pub fn api_registrations(&self) -> Vec<ApiRegistration> {
        self.descriptors
            .iter()
            .filter(|d| !d.is_bagged() && d.api_visible)
            .map(|d| ApiRegistration {
                name: d.name.clone(),
                levels: d.levels,
                description: d.description,
            })
            .collect()
    }
}

const ALL_LEVELS: &[Level] = &[Level::Feed, Level::Item, Level::Nomination, Level::Post];
const INP: &[Level] = &[Level::Item, Level::Nomination, Level::Post];
const NP: &[Level] = &[Level::Nomination, Level::Post];
const IN: &[Level] = &[Level::Item, Level::Nomination];
const FEED: &[Level] = &[Level::Feed];
const FEED_POST: &[Level] = &[Level::Feed, Level::Post];
const POST: &[Level] = &[Level::Post];

const REQ: u8 = 0b001;
const API: u8 = 0b010;
const ADM: u8 = 0b100;

fn field(
    name: &str,
    title: &'static str,
    description: &'static str,
    storage_kind: StorageKind,
    levels: &'static [Level],
    flags: u8,
) -> FieldDescriptor {
    FieldDescriptor {
        name: name.to_string(),
        title,
        description,
        storage_kind,
        levels,
        deprecated: false,
        replacement_name: None,
        api_visible: flags & API != 0,
        admin_only: flags & ADM != 0,
        required: flags & REQ != 0,
        error: None,
    }
}

fn deprecated(
    name: &str,
    replacement: &'static str,
    description: &'static str,
    levels: &'static [Level],
    flags: u8,
) -> FieldDescriptor {
    FieldDescriptor {
        deprecated: true,
        replacement_name: Some(replacement),
        ..field(name, "", description, StorageKind::Bagged, levels, flags)
    }
}

fn standard_structure() -> Vec<FieldDescriptor> {
    use StorageKind::{Bagged, Scalar};

    vec![
        field("item_id", "PressForward ID", "Hashed ID based on title and URL of retrieved item", Scalar, INP, REQ | API),
        field(MASTER_FIELD, "PressForward Metas", "Container of serialized fields", Scalar, INP, REQ),
        deprecated("origin_item_ID", "item_id", "Old name of item_id", INP, REQ),
        field("pf_item_post_id", "Item ID", "Record ID of the original item", Scalar, INP, REQ),
        field("nom_id", "Nomination ID", "Record ID of the nomination", Scalar, INP, REQ),
        field("pf_final_step_id", "Final Step ID", "Record ID of the post on the final step", Bagged, INP, 0),
        deprecated("item_feed_post_id", "pf_item_post_id", "Old name of pf_item_post_id", INP, REQ),
        field("source_title", "Source Title", "Title retrieved from the feed", Bagged, INP, API | ADM),
        field("pf_source_link", "Origin Item URL", "URL of the feed source", Bagged, INP, API | ADM),
        deprecated("pf_feed_item_source", "source_title", "Old name of source_title", INP, REQ),
        field("item_date", "Item Date", "Date posted on the original site", Scalar, INP, REQ | API),
        deprecated("posted_date", "item_date", "Old name of item_date", NP, REQ),
        field("item_author", "Item Author", "Author(s) listed on the original site", Scalar, INP, API | ADM),
        deprecated("authors", "item_author", "Old name of item_author", NP, 0),
        field("item_link", "Link to Source", "Link to the original post", Scalar, INP, REQ | API),
        deprecated("nomination_permalink", "item_link", "Old name of item_link", NP, REQ),
        field("item_feat_img", "Featured Image", "Featured image from source", Bagged, INP, 0),
        field("item_wp_date", "Time of Retrieval", "Time item was retrieved", Scalar, INP, REQ | API),
        field("date_nominated", "Time of Nomination", "Time nominated", Bagged, NP, REQ | API),
        field("item_tags", "Item Tags", "Tags associated with the item by source", Bagged, INP, ADM),
        field("source_repeat", "Repeated in Source", "Times retrieved", Bagged, INP, API),
        field("nomination_count", "Nominations", "Nomination count", Scalar, INP, REQ | API),
        field("submitted_by", "Submitted By", "User who submitted the nomination", Bagged, NP, REQ | API),
        field("nominator_array", "Nominators", "Users who nominated this item", Bagged, INP, REQ | API | ADM),
        field("sortable_item_date", "Sortable Date", "Timestamp for the item", Scalar, INP, REQ),
        field("readable_status", "Readability Status", "If the content is readable", Bagged, INP, REQ | API),
        field("revertible_feed_text", "Revertible Feed Text", "The originally retrieved description", Bagged, INP, 0),
        field("pf_feed_item_word_count", "Word Count", "Word count of original item text", Bagged, INP, API),
        field("pf_word_count", "Word Count", "Latest word count of the text", Scalar, INP, API),
        field("pf_archive", "Archive Status", "Archive state of the item", Scalar, INP, 0),
        field("_thumbnail_id", "Thumbnail ID", "Thumbnail id", Scalar, INP, ADM),
        field("archived_by_user_status", "Archived By User", "Users who have archived", Bagged, IN, 0),
        field("pf_feed_error_count", "Feed Error Count", "Count of feed errors", Bagged, FEED_POST, ADM),
        field("pf_forward_to_origin", "Forward to Origin", "User override for forwarding to origin of link", Scalar, POST, API | ADM),
        field("pf_feed_last_retrieved", "Last Retrieved", "Last time feed was retrieved", Scalar, FEED, API | ADM),
        field("pf_nominations_in_feed", "Nominations in Feed", "Nominations received by items supplied by this feed", Scalar, FEED, API | ADM),
        field("pf_feed_default_author", "Default Author", "Default author for items in the feed", Scalar, FEED, API | ADM),
        field("feedUrl", "Feed URL", "URL for a feed", Scalar, FEED, API | ADM),
        field("pf_feed_last_checked", "Last Checked", "Last time feed was checked", Scalar, FEED, ADM),
        field("pf_no_feed_alert", "No Feed Alert", "Feed alert status", Scalar, FEED, ADM),
        field("feed_type", "Feed Type", "Type of feed", Scalar, FEED, API | ADM),
        field("htmlUrl", "Site URL", "Site URL of a feed", Scalar, FEED, API | ADM),
        field("user_added", "User Added", "User who added a feed", Scalar, FEED, API | ADM),
        field("module_added", "Module Added", "Module to process a feed", Scalar, FEED, API | ADM),
        field("ab_alert_msg", "Alert Message", "Alert message processing and storage", Scalar, FEED, API | ADM),
        field("pf_meta_data_check", "Metadata Check", "Has metadata been completely added to a feed", Scalar, FEED, ADM),
        field("pf_source_statement", "Source Statement", "The source statement appended to an item", Scalar, ALL_LEVELS, ADM),
    ]
}
