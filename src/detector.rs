use std::sync::Arc;

use log::warn;

use crate::config::Settings;
use crate::geo::LocationResolver;
use crate::models::{AlertSpec, LogEvent};
use crate::rules::{RuleCtx, RULES};
use crate::store::StoreTx;

/// Runs every detection rule against one event, in the fixed registry
/// order. A failing rule is reported and skipped; the remaining rules
/// still run.
pub struct DetectionEngine {
    settings: Arc<Settings>,
    resolver: Arc<dyn LocationResolver>,
}

impl DetectionEngine {
    pub fn new(settings: Arc<Settings>, resolver: Arc<dyn LocationResolver>) -> Self {
        DetectionEngine { settings, resolver }
    }

    /// Evaluate `event` inside the transaction it was inserted in, so that
    /// window queries observe the triggering line itself.
    pub fn analyze(&self, tx: &StoreTx<'_>, event: &LogEvent) -> Vec<AlertSpec> {
        let ctx = RuleCtx {
            settings: &self.settings,
            resolver: self.resolver.as_ref(),
            tx,
        };

        let mut specs = Vec::new();
        for rule in RULES {
            match (rule.check)(&ctx, event) {
                Ok(Some(finding)) => specs.push(AlertSpec {
                    rule_name: rule.name,
                    severity: rule.severity,
                    description: finding.description,
                    context: finding.context,
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!("rule {} failed on event {}: {}", rule.name, event.id, e);
                }
            }
        }
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::StaticResolver;
    use crate::models::NewLogEvent;
    use crate::rules::{RULE_BLACKLISTED_IP, RULE_BRUTE_FORCE};
    use crate::store::SiemStore;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn one_event_can_raise_multiple_alerts() {
        let store = SiemStore::in_memory().unwrap();
        let settings = Arc::new(Settings::default());
        let engine = DetectionEngine::new(settings.clone(), Arc::new(StaticResolver::default()));
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        // five failed logins from a blacklisted address: the last one
        // trips both brute-force and blacklisted-ip
        let specs = store
            .transaction(|tx| {
                let mut last = None;
                for i in 0..5i64 {
                    last = Some(tx.insert_event(&NewLogEvent {
                        timestamp: base + Duration::minutes(i),
                        source_ip: "10.0.0.100".to_string(),
                        username: format!("user{}", i),
                        event_type: "login".to_string(),
                        status: "failed".to_string(),
                        raw_log: "auth check".to_string(),
                        source_file: None,
                        country_code: None,
                        latitude: None,
                        longitude: None,
                    })?);
                }
                Ok(engine.analyze(tx, &last.unwrap()))
            })
            .unwrap();

        let names: Vec<&str> = specs.iter().map(|s| s.rule_name).collect();
        assert!(names.contains(&RULE_BRUTE_FORCE));
        assert!(names.contains(&RULE_BLACKLISTED_IP));
    }
}
