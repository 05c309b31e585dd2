//! Axum-shared application state: one `Arc`-wrapped handle cloned into
//! every request.

use std::sync::Arc;

use relaysync_core::Supervisor;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub config: Arc<Config>,
}
