//! Shared application state handed to every axum handler.

use std::sync::Arc;

use crate::config::Config;
use crate::engine::{JobEngine, PubSubEngine};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobEngine>,
    pub pubsub: Arc<PubSubEngine>,
    pub config: Arc<Config>,
}
