pub mod auth;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod extractor;
pub mod importer;
pub mod logging;
pub mod models;
pub mod order;
pub mod poller;
pub mod session;
pub mod table;
pub mod tui;
pub mod vendor;
pub mod workflow;
