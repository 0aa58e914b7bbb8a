use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::count::YesNoCount;

pub type ToggleName = String;
pub type AppName = String;

/// Per-toggle counts keyed by toggle name, as reported in one bucket.
pub type BucketToggles = BTreeMap<ToggleName, ToggleCount>;

/// A bucket's toggles shared between the hour and minute windows.
pub type SharedToggles = Arc<BucketToggles>;

/// Raw counts an SDK reported for one toggle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleCount {
    /// Non-numeric values are treated as absent
    #[serde(default, deserialize_with = "lenient_count", skip_serializing_if = "Option::is_none")]
    pub yes: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count", skip_serializing_if = "Option::is_none")]
    pub no: Option<u64>,
    /// Entries with non-numeric counts are dropped
    #[serde(default, deserialize_with = "lenient_variants", skip_serializing_if = "Option::is_none")]
    pub variants: Option<BTreeMap<String, u64>>,
}

impl ToggleCount {
    pub fn new(yes: u64, no: u64) -> Self {
        Self {
            yes: Some(yes),
            no: Some(no),
            variants: None,
        }
    }

    pub fn with_variant(mut self, name: &str, count: u64) -> Self {
        self.variants
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), count);
        self
    }
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(count_of(&value))
}

fn lenient_variants<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_object().map(|entries| {
        entries
            .iter()
            .filter_map(|(name, count)| count_of(count).map(|count| (name.clone(), count)))
            .collect()
    }))
}

/// Whole counts pass through, non-negative floats are truncated and
/// anything else is not a count.
fn count_of(value: &serde_json::Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f.trunc() as u64)
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    #[serde(default)]
    pub toggles: BucketToggles,
}

/// A metrics report from one SDK instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
    pub app_name: AppName,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub bucket: Bucket,
}

fn default_instance_id() -> String {
    "default".into()
}

/// An SDK announcing itself on startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub app_name: AppName,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(default)]
    pub strategies: Vec<String>,
    pub started: DateTime<Utc>,
    /// Metrics reporting interval in milliseconds
    pub interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl ClientRegistration {
    /// Buffer key: one registration per application instance.
    pub fn client_key(&self) -> String {
        format!("{}_{}", self.app_name, self.instance_id)
    }
}

/// An application as held by the application store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub app_name: AppName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub announced: bool,
}

impl From<&ClientRegistration> for ApplicationRecord {
    fn from(reg: &ClientRegistration) -> Self {
        Self {
            app_name: reg.app_name.clone(),
            strategies: reg.strategies.clone(),
            created_by: reg.created_by.clone(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstance {
    pub app_name: AppName,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A single "instance was seen" update from the metrics endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSighting {
    pub app_name: AppName,
    pub instance_id: String,
    pub client_ip: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSummary {
    pub name: ToggleName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl FeatureSummary {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            feature_type: None,
            project: None,
            enabled: true,
            stale: false,
            last_seen_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_name: Option<String>,
}

// ============================================================================
// Query results
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TogglesMetrics {
    pub last_hour: BTreeMap<ToggleName, YesNoCount>,
    pub last_minute: BTreeMap<ToggleName, YesNoCount>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppWithToggles {
    pub app_name: AppName,
    pub seen_toggles: Vec<ToggleName>,
    pub metrics_count: u64,
}

/// An application that has reported a toggle, with store metadata merged in
/// when the application store knows it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenApp {
    pub app_name: AppName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strategies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl SeenApp {
    pub fn named(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            description: None,
            url: None,
            color: None,
            icon: None,
            strategies: Vec::new(),
            created_at: None,
            created_by: None,
        }
    }

    /// Carry every stored field of the application except its announce flag.
    pub fn merge(mut self, meta: &ApplicationRecord) -> Self {
        self.description = meta.description.clone();
        self.url = meta.url.clone();
        self.color = meta.color.clone();
        self.icon = meta.icon.clone();
        self.strategies = meta.strategies.clone();
        self.created_at = meta.created_at;
        self.created_by = meta.created_by.clone();
        self
    }
}

/// A reference resolved against a store, or a marker that it was not found.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lookup<T> {
    Found(T),
    Missing(MissingRef),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingRef {
    pub name: String,
    pub not_found: bool,
}

impl<T> Lookup<T> {
    pub fn missing(name: &str) -> Self {
        Lookup::Missing(MissingRef {
            name: name.to_string(),
            not_found: true,
        })
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationLinks {
    #[serde(rename = "self")]
    pub self_link: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDetails {
    pub app_name: AppName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub strategies: Vec<Lookup<StrategySummary>>,
    pub instances: Vec<AppInstance>,
    pub seen_toggles: Vec<Lookup<FeatureSummary>>,
    pub links: ApplicationLinks,
}
