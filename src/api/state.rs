//! Shared state for API handlers.

use crate::mirror::Mirror;

/// State injected into every handler
#[derive(Clone)]
pub struct AppState {
    /// The mirror core
    pub mirror: Mirror,
}

impl AppState {
    /// Wrap a mirror instance.
    pub fn new(mirror: Mirror) -> Self {
        Self { mirror }
    }
}
