pub mod abort;
pub mod analytics;
pub mod config;
mod dispatcher;
pub mod error;
pub mod factory;
pub mod http_client;
pub mod publisher;

pub use analytics::Analytics;
pub use config::Settings;
