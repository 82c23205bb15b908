pub mod config;
pub mod error;
pub mod http_backend;
pub mod logging;
pub mod push_connector;
