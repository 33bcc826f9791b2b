//! Results file for run parameters and measured metrics
//!
//! The file is a JSON document shaped like
//!
//! ```json
//! {"results": {"parameters": {...}, "metrics": [{"MetricName": ..., ...}]}}
//! ```
//!
//! Every store is a full read-modify-write of the file, so existing content
//! (including that of earlier, resumed runs) is merged rather than replaced.
//! There is no locking; only the lead worker writes.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One measured value.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub units: String,
    pub additional_data: Map<String, Value>,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        value: f64,
        units: impl Into<String>,
        additional_data: Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            units: units.into(),
            additional_data,
        }
    }
}

/// On-disk form of a [`Metric`].
#[derive(Debug, Serialize)]
struct MetricRecord<'a> {
    #[serde(rename = "MetricName")]
    name: &'a str,
    #[serde(rename = "MeasuredValue")]
    value: f64,
    #[serde(rename = "Units")]
    units: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "AdditionalData")]
    additional_data: &'a Map<String, Value>,
}

/// Writes parameters and metrics into a JSON results file.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    path: PathBuf,
}

impl MetricsRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append metric records, stamped with the current UTC time.
    pub fn store_metrics(&self, metrics: &[Metric]) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false);
        let records: Vec<MetricRecord<'_>> = metrics
            .iter()
            .map(|m| MetricRecord {
                name: &m.name,
                value: m.value,
                units: &m.units,
                timestamp: timestamp.clone(),
                additional_data: &m.additional_data,
            })
            .collect();
        let data = serde_json::to_value(records).context("Failed to serialize metrics")?;
        self.store(data, "metrics")
    }

    /// Merge run parameters; overlapping keys are overwritten.
    pub fn store_parameters(&self, parameters: Map<String, Value>) -> Result<()> {
        self.store(Value::Object(parameters), "parameters")
    }

    /// Merge `data` into the results mapping under `key`.
    ///
    /// An existing list is extended, an existing mapping is updated key by
    /// key, and anything else (missing, empty, or a scalar) is replaced.
    pub fn store(&self, data: Value, key: &str) -> Result<()> {
        let mut document = self.read()?;
        debug!(path = ?self.path, key, "updating results file");

        if document.is_empty() {
            let mut results = Map::new();
            results.insert(key.to_string(), data);
            document.insert("results".to_string(), Value::Object(results));
        } else if document.values().next().is_some_and(Value::is_object) {
            // Named entity: the first top-level object holds the results.
            if let Some(Value::Object(results)) = document.values_mut().next() {
                merge(results, key, data);
            }
        } else {
            merge(&mut document, key, data);
        }

        let text = serde_json::to_string(&Value::Object(document))
            .context("Failed to serialize results")?;
        fs::write(&self.path, text)
            .with_context(|| format!("Failed to write results file: {:?}", self.path))?;
        Ok(())
    }

    /// Current document; an absent, empty or `null` file reads as empty.
    fn read(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read results file: {:?}", self.path))?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse results file: {:?}", self.path))?;
        match value {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => anyhow::bail!(
                "results file {:?} holds {} instead of an object",
                self.path,
                kind(&other)
            ),
        }
    }
}

/// Lists extend lists and objects merge into objects; any other payload replaces the entry.
fn merge(results: &mut Map<String, Value>, key: &str, data: Value) {
    let data = match (results.get_mut(key), data) {
        (Some(Value::Array(current)), Value::Array(items)) if !current.is_empty() => {
            current.extend(items);
            return;
        }
        (Some(Value::Object(current)), Value::Object(entries)) if !current.is_empty() => {
            current.extend(entries);
            return;
        }
        (_, data) => data,
    };
    results.insert(key.to_string(), data);
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
