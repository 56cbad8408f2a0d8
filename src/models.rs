use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alert severity, ordered from least to most urgent.
/// Persisted and serialized as its canonical capitalized name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Normalized log event. Immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub username: String,
    pub event_type: String,
    pub status: String,
    pub raw_log: String,
    pub source_file: Option<String>,
    pub country_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Event record before it is assigned a row id by the store.
#[derive(Debug, Clone)]
pub struct NewLogEvent {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub username: String,
    pub event_type: String,
    pub status: String,
    pub raw_log: String,
    pub source_file: Option<String>,
    pub country_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A persisted alert with its full lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub alert_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub description: String,
    /// JSON-encoded context bag, `None` when the rule supplied nothing.
    pub context: Option<String>,
    pub source_ip: Option<String>,
    pub username: Option<String>,
    pub log_entry_id: Option<i64>,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Alert record before insertion.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub description: String,
    pub context: Option<String>,
    pub source_ip: Option<String>,
    pub username: Option<String>,
    pub log_entry_id: Option<i64>,
    pub triggered_at: DateTime<Utc>,
}

/// What a single rule reports when it fires.
#[derive(Debug, Clone)]
pub struct Finding {
    pub description: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// A finding tagged with the rule identity, ready for the alert manager.
#[derive(Debug, Clone)]
pub struct AlertSpec {
    pub rule_name: &'static str,
    pub severity: Severity,
    pub description: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Unresolved alert counts grouped by severity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertStatistics {
    #[serde(rename = "Critical")]
    pub critical: i64,
    #[serde(rename = "High")]
    pub high: i64,
    #[serde(rename = "Medium")]
    pub medium: i64,
    #[serde(rename = "Low")]
    pub low: i64,
    pub total: i64,
}

/// Outcome of one ingestion call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub ingested: usize,
    pub alerts_generated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_entry_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_roundtrips_through_strings() {
        for sev in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(sev.as_str().parse::<Severity>().unwrap(), sev);
        }
    }

    #[test]
    fn severity_parse_is_case_insensitive() {
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
