pub mod config;
pub mod domain;
pub mod error;
pub mod handler;
pub mod indexer;
pub mod reader;
pub mod store;
