use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use regex::Regex;

use crate::geo::LocationResolver;
use crate::models::NewLogEvent;

/// Compiled templates for the supported log formats, tried in order.
/// First match wins.
struct LogPatterns {
    /// Apache/Nginx access log
    apache_access: Regex,
    /// sshd authentication line (syslog prefix)
    ssh_auth: Regex,
    /// Generic authentication line with a recognised status word
    auth_log: Regex,
    /// Windows-style key/value line
    windows_event: Regex,
    /// Single-line JSON with timestamp/ip/user/status keys
    json_log: Regex,
    /// `timestamp ip username event_type status`
    simple_log: Regex,
    /// Last resort: any IPv4 literal
    ipv4: Regex,
}

static PATTERNS: LazyLock<LogPatterns> = LazyLock::new(|| LogPatterns {
    apache_access: Regex::new(
        r#"(?P<ip>\S+) .*? \[(?P<timestamp>.*?)\] .*?"\w+ (?P<path>\S+)"#,
    )
    .expect("invalid apache_access regex"),
    ssh_auth: Regex::new(
        r"(?P<timestamp>\w+ \d+ \d+:\d+:\d+) .*? (?P<event>Accepted|Failed) .*? (?P<source_ip>\d+\.\d+\.\d+\.\d+) .*? user (?P<username>\S+)",
    )
    .expect("invalid ssh_auth regex"),
    auth_log: Regex::new(
        r"(?i)(?P<timestamp>[\d\-:T.]+).*?(?P<source_ip>\d+\.\d+\.\d+\.\d+).*?user[:\s]+(?P<username>\S+).*?(?P<status>success|failed|denied|accepted|rejected)",
    )
    .expect("invalid auth_log regex"),
    windows_event: Regex::new(
        r"(?i)(?P<timestamp>[\d\-:T.]+).*?Source IP[:\s]+(?P<source_ip>\d+\.\d+\.\d+\.\d+).*?User[:\s]+(?P<username>\S+).*?Status[:\s]+(?P<status>\w+)",
    )
    .expect("invalid windows_event regex"),
    json_log: Regex::new(
        r#"(?is)\{.*?"timestamp"[:\s]+"(?P<timestamp>[^"]+)".*?"ip"[:\s]+"(?P<source_ip>[^"]+)".*?"user"[:\s]+"(?P<username>[^"]+)".*?"status"[:\s]+"(?P<status>[^"]+)".*?\}"#,
    )
    .expect("invalid json_log regex"),
    simple_log: Regex::new(
        r"(?P<timestamp>[\d\-:T.]+)\s+(?P<source_ip>\d+\.\d+\.\d+\.\d+)\s+(?P<username>\S+)\s+(?P<event_type>\w+)\s+(?P<status>\w+)",
    )
    .expect("invalid simple_log regex"),
    ipv4: Regex::new(r"\b(\d+\.\d+\.\d+\.\d+)\b").expect("invalid ipv4 regex"),
});

/// Parse a timestamp string in any of the formats seen across the supported
/// log families. Naive datetimes are interpreted as UTC. Returns `None`
/// when nothing matches; callers substitute the ingest wall clock.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    // ISO 8601 with an explicit offset (trailing Z included).
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Unix epoch seconds, integer or float.
    if let Ok(epoch) = s.parse::<f64>() {
        if epoch.is_finite() && epoch >= 0.0 {
            let secs = epoch.trunc() as i64;
            let nanos = (epoch.fract() * 1e9) as u32;
            if let Some(dt) = DateTime::from_timestamp(secs, nanos) {
                return Some(dt);
            }
        }
    }

    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%d/%b/%Y:%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ];
    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    // Syslog style carries no year; assume the current one.
    let with_year = format!("{} {}", Utc::now().year(), s);
    if let Ok(naive) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S") {
        return Some(naive.and_utc());
    }

    None
}

/// Maps heterogeneous raw lines onto the normalized event schema and
/// enriches them with geolocation.
pub struct LogParser {
    resolver: Arc<dyn LocationResolver>,
}

impl LogParser {
    pub fn new(resolver: Arc<dyn LocationResolver>) -> Self {
        LogParser { resolver }
    }

    /// Parse one raw line. Returns `None` when the line is empty or no
    /// template (including the bare-IPv4 fallback) applies.
    pub fn parse_line(&self, line: &str, source_file: Option<&str>) -> Option<NewLogEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let fields = extract_fields(line)?;

        let timestamp = fields
            .get("timestamp")
            .and_then(|raw| parse_timestamp(raw))
            .unwrap_or_else(Utc::now);

        let source_ip = fields
            .get("source_ip")
            .or_else(|| fields.get("ip"))
            .cloned()
            .unwrap_or_default();
        let username = fields.get("username").cloned().unwrap_or_default();
        let event_type = fields
            .get("event_type")
            .or_else(|| fields.get("event"))
            .cloned()
            .unwrap_or_else(|| "authentication".to_string());
        let status = fields
            .get("status")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let location = if source_ip.is_empty() {
            None
        } else {
            self.resolver.get_location(&source_ip)
        };

        Some(NewLogEvent {
            timestamp,
            source_ip,
            username,
            event_type: event_type.to_lowercase(),
            status: status.to_lowercase(),
            raw_log: line.to_string(),
            source_file: source_file.map(str::to_string),
            country_code: location.as_ref().and_then(|l| l.country_code.clone()),
            latitude: location.as_ref().and_then(|l| l.latitude),
            longitude: location.as_ref().and_then(|l| l.longitude),
        })
    }
}

/// Run the pattern table against a line and collect the named captures.
/// On a miss, fall back to hunting for a bare IPv4 literal.
fn extract_fields(line: &str) -> Option<HashMap<String, String>> {
    let p = &*PATTERNS;
    let table = [
        &p.apache_access,
        &p.ssh_auth,
        &p.auth_log,
        &p.windows_event,
        &p.json_log,
        &p.simple_log,
    ];

    for pattern in table {
        let Some(caps) = pattern.captures(line) else {
            continue;
        };
        let mut fields = HashMap::new();
        for name in pattern.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                fields.insert(name.to_string(), m.as_str().to_string());
            }
        }
        normalize_event_capture(&mut fields);
        return Some(fields);
    }

    // Fallback: any line naming an IPv4 address still becomes an event.
    let ip = PATTERNS.ipv4.captures(line)?.get(1)?.as_str().to_string();
    let mut fields = HashMap::new();
    fields.insert("source_ip".to_string(), ip);
    fields.insert("event_type".to_string(), "unknown".to_string());
    fields.insert("status".to_string(), "unknown".to_string());
    Some(fields)
}

/// The ssh template captures a literal `Accepted`/`Failed` word instead of
/// separate event/status fields; translate it.
fn normalize_event_capture(fields: &mut HashMap<String, String>) {
    if fields.contains_key("event_type") {
        return;
    }
    let Some(event) = fields.get("event").map(|e| e.to_lowercase()) else {
        return;
    };
    match event.as_str() {
        "accepted" | "success" => {
            fields.insert("status".to_string(), "success".to_string());
            fields.insert("event_type".to_string(), "login".to_string());
        }
        "failed" | "denied" | "rejected" => {
            fields.insert("status".to_string(), "failed".to_string());
            fields.insert("event_type".to_string(), "login".to_string());
        }
        other => {
            fields.insert("event_type".to_string(), other.to_string());
        }
    }
}
