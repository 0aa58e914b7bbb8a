//! JSON-lines input
//!
//! Each non-blank line is either a metrics report or a client registration,
//! told apart by shape: metrics carry a `bucket`, registrations do not.
//! Lines starting with `#` are comments.

use serde::Deserialize;
use unleash_metrics_core::ValidationError;
use unleash_metrics_core::model::{ClientMetrics, ClientRegistration};
use unleash_metrics_core::schema;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundLine {
    Metrics(ClientMetrics),
    Registration(ClientRegistration),
}

pub fn parse_line(line: &str) -> Result<Option<InboundLine>, ValidationError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    schema::parse_json(trimmed).map(Some)
}
