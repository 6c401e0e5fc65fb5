pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod server;

pub use config::{AppConfig, LoggingConfig, ServerConfig};
pub use error::ApiError;
pub use handlers::AppState;
pub use observability::init_tracing;
pub use server::{ServerBuilder, TiercacheServer, build_app};
