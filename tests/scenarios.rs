//! End-to-end detection scenarios: the full ingest -> detect -> alert
//! pipeline running against an in-memory store and a fixed location table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;

use logwarden::alerts::generate_alert_id;
use logwarden::geo::{GeoInfo, LocationResolver, StaticResolver};
use logwarden::models::{Alert, NewAlert};
use logwarden::store::AlertFilter;
use logwarden::{
    AlertManager, DetectionEngine, IncomingLog, IngestionService, LogParser, Settings, Severity,
    SiemStore,
};

struct Harness {
    store: Arc<SiemStore>,
    service: IngestionService,
    alerts: Arc<AlertManager>,
}

fn harness() -> Harness {
    let store = Arc::new(SiemStore::in_memory().unwrap());
    let settings = Arc::new(Settings::default());

    let mut table = HashMap::new();
    table.insert(
        "198.51.100.10".to_string(),
        GeoInfo {
            country_code: Some("US".to_string()),
            latitude: Some(37.77),
            longitude: Some(-122.42),
            city: Some("San Francisco".to_string()),
            country_name: Some("United States".to_string()),
        },
    );
    table.insert(
        "203.0.113.20".to_string(),
        GeoInfo {
            country_code: Some("JP".to_string()),
            latitude: Some(35.68),
            longitude: Some(139.69),
            city: Some("Tokyo".to_string()),
            country_name: Some("Japan".to_string()),
        },
    );
    let resolver: Arc<dyn LocationResolver> = Arc::new(StaticResolver::new(table));

    let alerts = Arc::new(AlertManager::new(store.clone()));
    let service = IngestionService::new(
        store.clone(),
        LogParser::new(resolver.clone()),
        DetectionEngine::new(settings, resolver.clone()),
        alerts.clone(),
        resolver,
    );
    Harness { store, service, alerts }
}

fn login(ts: &str, ip: &str, user: &str, status: &str) -> IncomingLog {
    IncomingLog {
        timestamp: Some(ts.to_string()),
        source_ip: ip.to_string(),
        username: Some(user.to_string()),
        event_type: "login".to_string(),
        status: status.to_string(),
        raw_log: None,
    }
}

fn alerts_for_rule(h: &Harness, rule: &str) -> Vec<Alert> {
    h.alerts
        .list(&AlertFilter {
            rule_name: Some(rule.to_string()),
            limit: Some(100),
            ..AlertFilter::default()
        })
        .unwrap()
}

fn context_of(alert: &Alert) -> Value {
    serde_json::from_str(alert.context.as_deref().unwrap()).unwrap()
}

#[test]
fn brute_force_five_failures_raise_one_alert() {
    let h = harness();
    let lines = [
        "2024-05-01T10:00:00 203.0.113.7 user1 login failed",
        "2024-05-01T10:01:00 203.0.113.7 user2 login failed",
        "2024-05-01T10:02:00 203.0.113.7 user3 login failed",
        "2024-05-01T10:03:00 203.0.113.7 user4 login failed",
        "2024-05-01T10:04:00 203.0.113.7 user5 login failed",
    ];
    let report = h.service.ingest_lines(lines, None).unwrap();
    assert_eq!(report.ingested, 5);
    assert_eq!(report.alerts_generated, 1);

    let alerts = alerts_for_rule(&h, "brute_force_login");
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.severity, Severity::High);
    assert_eq!(alert.source_ip.as_deref(), Some("203.0.113.7"));

    let context = context_of(alert);
    assert_eq!(context["failed_attempts"], serde_json::json!(5));
    assert_eq!(context["time_window_minutes"], serde_json::json!(10));
}

#[test]
fn brute_force_sixth_failure_is_deduplicated() {
    let h = harness();
    let first_batch = [
        "2024-05-01T10:00:00 203.0.113.7 user1 login failed",
        "2024-05-01T10:01:00 203.0.113.7 user2 login failed",
        "2024-05-01T10:02:00 203.0.113.7 user3 login failed",
        "2024-05-01T10:03:00 203.0.113.7 user4 login failed",
        "2024-05-01T10:04:00 203.0.113.7 user5 login failed",
    ];
    h.service.ingest_lines(first_batch, None).unwrap();

    let report = h
        .service
        .ingest_lines(["2024-05-01T10:05:00 203.0.113.7 user6 login failed"], None)
        .unwrap();
    assert_eq!(report.alerts_generated, 0);

    let count = h.store.transaction(|tx| tx.count_events()).unwrap();
    assert_eq!(count, 6);
    assert_eq!(alerts_for_rule(&h, "brute_force_login").len(), 1);
}

#[test]
fn impossible_travel_between_continents() {
    let h = harness();
    let first = h
        .service
        .ingest_single(&login("2024-05-01T12:00:00Z", "198.51.100.10", "alice", "success"))
        .unwrap();
    assert_eq!(first.alerts_generated, 0);

    let second = h
        .service
        .ingest_single(&login("2024-05-01T12:30:00Z", "203.0.113.20", "alice", "success"))
        .unwrap();
    assert_eq!(second.alerts_generated, 1);

    let alerts = alerts_for_rule(&h, "impossible_travel");
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.username.as_deref(), Some("alice"));

    let context = context_of(alert);
    let distance = context["distance_km"].as_f64().unwrap();
    assert!(
        (8200.0..8400.0).contains(&distance),
        "San Francisco to Tokyo should be ~8280 km, got {}",
        distance
    );
    assert_eq!(context["time_hours"].as_f64().unwrap(), 0.5);
    assert_eq!(context["previous_ip"], serde_json::json!("198.51.100.10"));
    assert_eq!(context["current_ip"], serde_json::json!("203.0.113.20"));
}

#[test]
fn off_hours_login_alerts_on_weekdays_only() {
    let h = harness();

    // Thursday 03:15 UTC
    let report = h
        .service
        .ingest_single(&login("2024-05-02T03:15:00Z", "198.51.100.11", "bob", "success"))
        .unwrap();
    assert_eq!(report.alerts_generated, 1);

    let alerts = alerts_for_rule(&h, "login_outside_business_hours");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Medium);

    // Saturday 03:15 UTC: same event, no alert
    let weekend = h
        .service
        .ingest_single(&login("2024-05-04T03:15:00Z", "198.51.100.11", "bob", "success"))
        .unwrap();
    assert_eq!(weekend.alerts_generated, 0);
    assert_eq!(alerts_for_rule(&h, "login_outside_business_hours").len(), 1);
}

#[test]
fn blacklisted_ip_alerts_and_respects_dedup_window() {
    let h = harness();
    let now = Utc::now();

    let first = h
        .service
        .ingest_single(&login(&now.to_rfc3339(), "10.0.0.100", "eve", "failed"))
        .unwrap();
    assert_eq!(first.alerts_generated, 1);
    let alerts = alerts_for_rule(&h, "blacklisted_ip");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);

    // ten minutes on: the open alert suppresses a duplicate
    let later = now + Duration::minutes(10);
    let second = h
        .service
        .ingest_single(&login(&later.to_rfc3339(), "10.0.0.100", "eve", "failed"))
        .unwrap();
    assert_eq!(second.alerts_generated, 0);
}

#[test]
fn blacklisted_ip_alerts_again_after_the_window() {
    let h = harness();
    let now = Utc::now();

    // an open blacklist alert raised 61 minutes ago
    h.store
        .transaction(|tx| {
            tx.insert_alert(&NewAlert {
                alert_id: generate_alert_id(),
                rule_name: "blacklisted_ip".to_string(),
                severity: Severity::Critical,
                description: "Activity detected from blacklisted IP address: 10.0.0.100"
                    .to_string(),
                context: None,
                source_ip: Some("10.0.0.100".to_string()),
                username: Some("eve".to_string()),
                log_entry_id: None,
                triggered_at: now - Duration::minutes(61),
            })
        })
        .unwrap();

    let report = h
        .service
        .ingest_single(&login(&now.to_rfc3339(), "10.0.0.100", "eve", "failed"))
        .unwrap();
    assert_eq!(report.alerts_generated, 1);
    assert_eq!(alerts_for_rule(&h, "blacklisted_ip").len(), 2);
}

#[test]
fn alert_lifecycle_acknowledge_then_resolve() {
    let h = harness();
    h.service
        .ingest_single(&login(&Utc::now().to_rfc3339(), "10.0.0.100", "eve", "failed"))
        .unwrap();
    let alert_id = alerts_for_rule(&h, "blacklisted_ip")[0].alert_id.clone();

    h.alerts.acknowledge(&alert_id, Some("carol")).unwrap();
    let resolved = h.alerts.resolve(&alert_id, Some("carol")).unwrap();

    assert!(resolved.acknowledged);
    assert_eq!(resolved.acknowledged_by.as_deref(), Some("carol"));
    assert!(resolved.resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some("carol"));
    assert!(resolved.resolved_at.unwrap() >= resolved.acknowledged_at.unwrap());
}

#[test]
fn resolving_an_alert_reopens_detection() {
    let h = harness();
    let now = Utc::now();

    h.service
        .ingest_single(&login(&now.to_rfc3339(), "10.0.0.100", "eve", "failed"))
        .unwrap();
    let alert_id = alerts_for_rule(&h, "blacklisted_ip")[0].alert_id.clone();
    h.alerts.resolve(&alert_id, None).unwrap();

    // dedup only consults unresolved alerts, so the next event fires again
    let report = h
        .service
        .ingest_single(&login(&now.to_rfc3339(), "10.0.0.100", "eve", "failed"))
        .unwrap();
    assert_eq!(report.alerts_generated, 1);
}

#[test]
fn persisted_events_are_normalized_lowercase() {
    let h = harness();
    h.service
        .ingest_single(&IncomingLog {
            timestamp: Some("2024-05-01T10:00:00Z".to_string()),
            source_ip: "198.51.100.7".to_string(),
            username: Some("Bob".to_string()),
            event_type: "LOGIN".to_string(),
            status: "Failed".to_string(),
            raw_log: None,
        })
        .unwrap();

    let (events, _) = h
        .store
        .transaction(|tx| tx.search_events(&Default::default()))
        .unwrap();
    assert_eq!(events[0].event_type, "login");
    assert_eq!(events[0].status, "failed");
}
