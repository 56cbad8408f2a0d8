use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use serde::Deserialize;

use crate::alerts::AlertManager;
use crate::detector::DetectionEngine;
use crate::error::SiemError;
use crate::geo::LocationResolver;
use crate::models::{IngestReport, NewLogEvent};
use crate::parser::{parse_timestamp, LogParser};
use crate::store::SiemStore;

/// Structured event as accepted on the single and bulk ingest endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingLog {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub source_ip: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    pub status: String,
    #[serde(default)]
    pub raw_log: Option<String>,
}

fn default_event_type() -> String {
    "authentication".to_string()
}

/// Orchestrates one ingestion batch: parse, persist, detect, alert, and a
/// single commit at the end. A line that fails to parse is skipped; a
/// storage failure rolls the whole batch back.
pub struct IngestionService {
    store: Arc<SiemStore>,
    parser: LogParser,
    engine: DetectionEngine,
    alerts: Arc<AlertManager>,
    resolver: Arc<dyn LocationResolver>,
}

impl IngestionService {
    pub fn new(
        store: Arc<SiemStore>,
        parser: LogParser,
        engine: DetectionEngine,
        alerts: Arc<AlertManager>,
        resolver: Arc<dyn LocationResolver>,
    ) -> Self {
        IngestionService { store, parser, engine, alerts, resolver }
    }

    /// Ingest raw text lines as one transaction.
    pub fn ingest_lines<'a, I>(
        &self,
        lines: I,
        source_file: Option<&str>,
    ) -> Result<IngestReport, SiemError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let report = self.store.transaction(|tx| {
            let mut ingested = 0usize;
            let mut alerts_generated = 0usize;

            for (line_no, line) in lines.into_iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let Some(new_event) = self.parser.parse_line(line, source_file) else {
                    debug!("line {} dropped: no template matched", line_no + 1);
                    continue;
                };

                let event = tx.insert_event(&new_event)?;
                let specs = self.engine.analyze(tx, &event);
                for spec in &specs {
                    self.alerts.create_alert(tx, spec, Some(&event))?;
                }
                alerts_generated += specs.len();
                ingested += 1;
            }

            Ok(IngestReport {
                ingested,
                alerts_generated,
                source_file: None,
                log_entry_id: None,
            })
        })?;

        info!(
            "batch ingested: {} events, {} alerts{}",
            report.ingested,
            report.alerts_generated,
            source_file.map(|f| format!(" (source {})", f)).unwrap_or_default()
        );
        Ok(report)
    }

    /// Ingest one structured event. Field normalization mirrors the line
    /// parser: lowercase tokens, empty username default, geolocation from
    /// the source IP.
    pub fn ingest_single(&self, log: &IncomingLog) -> Result<IngestReport, SiemError> {
        let timestamp = log
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let location = if log.source_ip.is_empty() {
            None
        } else {
            self.resolver.get_location(&log.source_ip)
        };

        let new_event = NewLogEvent {
            timestamp,
            source_ip: log.source_ip.clone(),
            username: log.username.clone().unwrap_or_default(),
            event_type: log.event_type.to_lowercase(),
            status: log.status.to_lowercase(),
            raw_log: log.raw_log.clone().unwrap_or_default(),
            source_file: None,
            country_code: location.as_ref().and_then(|l| l.country_code.clone()),
            latitude: location.as_ref().and_then(|l| l.latitude),
            longitude: location.as_ref().and_then(|l| l.longitude),
        };

        self.store.transaction(|tx| {
            let event = tx.insert_event(&new_event)?;
            let specs = self.engine.analyze(tx, &event);
            for spec in &specs {
                self.alerts.create_alert(tx, spec, Some(&event))?;
            }
            Ok(IngestReport {
                ingested: 1,
                alerts_generated: specs.len(),
                source_file: None,
                log_entry_id: Some(event.id),
            })
        })
    }

    /// Bulk structured ingestion: each entry is rendered to a simple log
    /// line and the batch goes through the line pipeline, so both paths
    /// share one orchestrator.
    pub fn ingest_bulk(&self, logs: &[IncomingLog]) -> Result<IngestReport, SiemError> {
        let lines: Vec<String> = logs.iter().map(render_line).collect();
        self.ingest_lines(lines.iter().map(String::as_str), None)
    }

    /// Ingest an uploaded text file, line by line.
    pub fn ingest_file_bytes(
        &self,
        bytes: &[u8],
        filename: Option<&str>,
    ) -> Result<IngestReport, SiemError> {
        let name = filename.unwrap_or("upload.log");
        let text = String::from_utf8_lossy(bytes);
        let mut report = self.ingest_lines(text.lines(), Some(name))?;
        report.source_file = Some(name.to_string());
        Ok(report)
    }
}

/// Render a structured entry as a `timestamp ip username event_type status`
/// line. The timestamp is re-emitted without an offset so the simple
/// template recognises it.
fn render_line(log: &IncomingLog) -> String {
    let timestamp = log
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);
    let username = match log.username.as_deref() {
        Some(u) if !u.is_empty() => u,
        _ => "unknown",
    };
    let mut line = format!(
        "{} {} {} {} {}",
        timestamp.format("%Y-%m-%dT%H:%M:%S"),
        log.source_ip,
        username,
        log.event_type,
        log.status
    );
    if let Some(raw) = log.raw_log.as_deref() {
        if !raw.is_empty() {
            line.push(' ');
            line.push_str(raw);
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::StaticResolver;
    use crate::config::Settings;
    use crate::store::EventFilter;

    fn service() -> (Arc<SiemStore>, IngestionService) {
        let store = Arc::new(SiemStore::in_memory().unwrap());
        let settings = Arc::new(Settings::default());
        let resolver: Arc<dyn LocationResolver> = Arc::new(StaticResolver::default());
        let service = IngestionService::new(
            store.clone(),
            LogParser::new(resolver.clone()),
            DetectionEngine::new(settings, resolver.clone()),
            Arc::new(AlertManager::new(store.clone())),
            resolver,
        );
        (store, service)
    }

    #[test]
    fn unparseable_lines_do_not_abort_the_batch() {
        let (store, service) = service();
        let lines = [
            "2024-05-01T10:00:00 198.51.100.7 bob login failed",
            "complete garbage with no address",
            "2024-05-01T10:01:00 198.51.100.7 bob login failed",
        ];
        let report = service.ingest_lines(lines, None).unwrap();
        assert_eq!(report.ingested, 2);

        let count = store.transaction(|tx| tx.count_events()).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn single_ingest_normalizes_and_returns_id() {
        let (store, service) = service();
        let report = service
            .ingest_single(&IncomingLog {
                timestamp: Some("2024-05-01T10:00:00Z".to_string()),
                source_ip: "198.51.100.7".to_string(),
                username: None,
                event_type: "Login".to_string(),
                status: "FAILED".to_string(),
                raw_log: None,
            })
            .unwrap();
        assert_eq!(report.ingested, 1);
        let id = report.log_entry_id.unwrap();

        let event = store.transaction(|tx| tx.get_event(id)).unwrap().unwrap();
        assert_eq!(event.event_type, "login");
        assert_eq!(event.status, "failed");
        assert_eq!(event.username, "");
    }

    #[test]
    fn bulk_ingest_reuses_the_line_pipeline() {
        let (store, service) = service();
        let logs = vec![
            IncomingLog {
                timestamp: Some("2024-05-01T10:00:00Z".to_string()),
                source_ip: "198.51.100.7".to_string(),
                username: Some("bob".to_string()),
                event_type: "login".to_string(),
                status: "failed".to_string(),
                raw_log: None,
            },
            IncomingLog {
                timestamp: Some("2024-05-01T10:01:00Z".to_string()),
                source_ip: "198.51.100.7".to_string(),
                username: None,
                event_type: "login".to_string(),
                status: "failed".to_string(),
                raw_log: None,
            },
        ];
        let report = service.ingest_bulk(&logs).unwrap();
        assert_eq!(report.ingested, 2);

        let (events, total) = store
            .transaction(|tx| {
                tx.search_events(&EventFilter {
                    source_ip: Some("198.51.100.7".to_string()),
                    ..EventFilter::default()
                })
            })
            .unwrap();
        assert_eq!(total, 2);
        // entries without a username are rendered with the placeholder
        assert!(events.iter().any(|e| e.username == "unknown"));
        assert!(events.iter().any(|e| e.username == "bob"));
        // the client timestamp survives the round trip through text
        assert!(events.iter().all(|e| e.timestamp.format("%Y-%m").to_string() == "2024-05"));
    }

    #[test]
    fn file_ingest_tags_the_source() {
        let (store, service) = service();
        let content = b"2024-05-01T10:00:00 198.51.100.7 bob login failed\n\n";
        let report = service.ingest_file_bytes(content, Some("auth.log")).unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.source_file.as_deref(), Some("auth.log"));

        let (events, _) = store
            .transaction(|tx| tx.search_events(&EventFilter::default()))
            .unwrap();
        assert_eq!(events[0].source_file.as_deref(), Some("auth.log"));
    }
}
