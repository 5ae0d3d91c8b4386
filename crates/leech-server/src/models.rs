//! API response models not owned by the engine.

use serde::Serialize;

/// Plain acknowledgement.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// Response body for GET /api/badge.
#[derive(Debug, Serialize)]
pub struct BadgeResponse {
    /// Label shown on the badge; empty for zero.
    pub text: String,
    /// Requests captured for the active tab's site.
    pub count: usize,
    /// Badge background color.
    pub color: &'static str,
}

/// Response body for GET /api/sites.
#[derive(Debug, Serialize)]
pub struct SitesResponse {
    pub sites: Vec<&'static str>,
}
