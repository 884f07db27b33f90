use axum::{
    Router,
    routing::{IntoMakeService, get},
};
use tower_http::cors::{Any, CorsLayer};

use crate::AppState;

pub mod guardians;
pub mod health;
pub mod steps;
pub mod workers;
pub mod workflows;

pub fn router(state: AppState) -> IntoMakeService<Router> {
    let api_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(workflows::router())
        .merge(steps::router())
        .merge(workers::router())
        .merge(guardians::router())
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .into_make_service()
}
