pub mod health;
pub mod operations;
pub mod tenants;

use crate::{api_docs::ApiDoc, auth::require_api_key, state::AppState};
use axum::{middleware, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(health::routes()) // Health routes don't need the API key
        .merge(
            tenants::routes()
                .merge(operations::routes())
                .layer(middleware::from_fn_with_state(state.clone(), require_api_key)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
