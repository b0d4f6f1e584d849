use std::sync::Arc;
use crate::application::services::VehicleCountingService;

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Detection + rendering use case, built once at startup.
    pub counter: Arc<VehicleCountingService>,
}
