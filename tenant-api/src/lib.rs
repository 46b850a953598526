pub mod api_docs;
pub mod auth;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod routes;
pub mod state;
pub mod tables;

pub use config::{Config, StalePolicy};
pub use error::{ApiError, ApiResult};
pub use reconciler::{reconcile_once, start_reconciler_task};
pub use routes::create_app;
pub use state::AppState;
pub use tables::{TableInitializer, TablesSettings};
