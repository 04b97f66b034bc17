pub mod core;
mod meta;
mod options;
mod records;
mod schema;
mod terms;

// Re-export Database and essential traits
pub use self::core::Database;
pub use self::core::DbConflictErrorExt;
