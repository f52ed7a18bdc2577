pub mod cache;
pub mod common;
pub mod constants;
pub mod entities;
pub mod facts;
pub mod loader;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod raw_row;
pub mod reader;
pub mod records;
pub mod report;
pub mod resolver;
pub mod rest_store;
pub mod sqlite_store;
pub mod store;
pub mod summary;
