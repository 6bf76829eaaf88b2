pub mod config;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod sync;
