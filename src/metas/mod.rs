//! Metadata for feeds, items, nominations and posts.
//!
//! `registry` declares every field; `access` reads and writes them through the
//! storage ports, handling the serialized container, deprecated names and
//! computed fallbacks.

mod access;
pub mod registry;

pub use self::access::{CopySummary, MetaAccess, OPTION_LINK_TO_SOURCE};
pub use self::registry::{
    fields, ApiRegistration, DescriptorError, FieldDescriptor, FieldRegistry, Level, StorageKind, UseContext,
    MASTER_FIELD,
};

use crate::store::RecordKind;

/// Level of a record kind name such as `pf_feed` or `nomination`.
pub fn level_for_kind(kind: &str) -> Option<Level> {
    RecordKind::parse(kind).map(Level::for_kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_kind() {
        assert_eq!(level_for_kind("pf_feed"), Some(Level::Feed));
        assert_eq!(level_for_kind("feed"), Some(Level::Feed));
        assert_eq!(level_for_kind("pf_feed_item"), Some(Level::Item));
        assert_eq!(level_for_kind("nomination"), Some(Level::Nomination));
        assert_eq!(level_for_kind("post"), Some(Level::Post));
        assert_eq!(level_for_kind("attachment"), None);
    }
}
