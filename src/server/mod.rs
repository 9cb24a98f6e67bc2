//! The Broker Server (BS): wires the HTTP surface together from
//! [`handlers`] and [`state`], with CORS / body-size-limit / tracing
//! middleware applied the way the teacher's `do_client_loop` wrapped every
//! connection in an `#[instrument]` span.

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::http::Method;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let parsed: Vec<_> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors);
    let body_limit = RequestBodyLimitLayer::new(state.config.request_max_size as usize);
    let static_root = state.config.static_root.clone();

    Router::new()
        .route("/queues", put(handlers::create_queue))
        .route(
            "/tasks",
            put(handlers::add_task)
                .post(handlers::take_task)
                .delete(handlers::remove_task),
        )
        .route("/tasks/counts", get(handlers::count_tasks))
        .route("/tasks/reset", post(handlers::reset_task))
        .route("/tasks/unstale", put(handlers::unstale_tasks))
        .route("/publish", put(handlers::publish))
        .route("/subscribe_one", post(handlers::subscribe_one))
        .route("/subscribe_stream", post(handlers::subscribe_stream))
        .nest_service("/static", ServeDir::new(static_root))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(body_limit)
        .with_state(state)
}
