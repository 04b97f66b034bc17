pub mod config;
pub mod db;
pub mod environment;
pub mod error;
pub mod logging;
pub mod metas;
pub mod retrieval;
pub mod rss;
pub mod store;
pub mod web;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_RETRIEVAL: &str = "retrieval";
