//! Boundary validation for inbound payloads
//!
//! Deserialization enforces types; these checks enforce the remaining shape
//! rules before anything reaches the aggregation core.

use serde::de::DeserializeOwned;

use crate::error::ValidationError;
use crate::model::{ApplicationRecord, ClientMetrics, ClientRegistration};

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    Ok(())
}

pub fn validate_client_metrics(metrics: &ClientMetrics) -> Result<(), ValidationError> {
    require("appName", &metrics.app_name)?;
    require("instanceId", &metrics.instance_id)?;

    if metrics.bucket.toggles.keys().any(|name| name.trim().is_empty()) {
        return Err(ValidationError::InvalidField {
            field: "bucket.toggles",
            reason: "toggle names must not be empty".into(),
        });
    }

    Ok(())
}

pub fn validate_registration(registration: &ClientRegistration) -> Result<(), ValidationError> {
    require("appName", &registration.app_name)?;
    require("instanceId", &registration.instance_id)?;

    if registration.strategies.iter().any(|s| s.trim().is_empty()) {
        return Err(ValidationError::InvalidField {
            field: "strategies",
            reason: "strategy names must not be empty".into(),
        });
    }

    Ok(())
}

pub fn validate_application(app: &ApplicationRecord) -> Result<(), ValidationError> {
    require("appName", &app.app_name)?;

    if let Some(url) = &app.url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ValidationError::InvalidField {
                field: "url",
                reason: format!("'{}' is not an http(s) uri", url),
            });
        }
    }

    Ok(())
}

/// Deserialize a JSON payload, mapping decode failures to validation errors.
pub fn parse_json<T: DeserializeOwned>(input: &str) -> Result<T, ValidationError> {
    serde_json::from_str(input).map_err(|e| ValidationError::Malformed {
        reason: e.to_string(),
    })
}

pub fn parse_client_metrics(input: &str) -> Result<ClientMetrics, ValidationError> {
    let metrics: ClientMetrics = parse_json(input)?;
    validate_client_metrics(&metrics)?;
    Ok(metrics)
}

pub fn parse_registration(input: &str) -> Result<ClientRegistration, ValidationError> {
    let registration: ClientRegistration = parse_json(input)?;
    validate_registration(&registration)?;
    Ok(registration)
}
