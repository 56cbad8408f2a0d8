use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::SiemError;
use crate::models::{Alert, AlertSpec, AlertStatistics, LogEvent, NewAlert};
use crate::store::{AlertFilter, SiemStore, StoreTx};

const DEFAULT_ANALYST: &str = "System";

/// Fresh alert identifier in canonical 8-4-4-4-12 form.
pub fn generate_alert_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mints, stores and transitions alerts. Lifecycle transitions are one-way
/// and idempotent; a second acknowledge or resolve leaves the record
/// untouched.
pub struct AlertManager {
    store: Arc<SiemStore>,
}

impl AlertManager {
    pub fn new(store: Arc<SiemStore>) -> Self {
        AlertManager { store }
    }

    /// Persist a detection finding inside the ingestion transaction.
    /// Correlation keys and the event back-reference come from the origin
    /// event; `triggered_at` is the current wall clock.
    pub fn create_alert(
        &self,
        tx: &StoreTx<'_>,
        spec: &AlertSpec,
        origin: Option<&LogEvent>,
    ) -> Result<Alert, SiemError> {
        let context = if spec.context.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&spec.context)?)
        };

        tx.insert_alert(&NewAlert {
            alert_id: generate_alert_id(),
            rule_name: spec.rule_name.to_string(),
            severity: spec.severity,
            description: spec.description.clone(),
            context,
            source_ip: origin.map(|e| e.source_ip.clone()),
            username: origin.map(|e| e.username.clone()),
            log_entry_id: origin.map(|e| e.id),
            triggered_at: Utc::now(),
        })
    }

    pub fn acknowledge(&self, alert_id: &str, analyst: Option<&str>) -> Result<Alert, SiemError> {
        let analyst = analyst.unwrap_or(DEFAULT_ANALYST).to_string();
        self.store.transaction(|tx| {
            let alert = tx.get_alert(alert_id)?.ok_or(SiemError::NotFound("alert"))?;
            if !alert.acknowledged {
                tx.mark_acknowledged(alert_id, &analyst, Utc::now())?;
            }
            tx.get_alert(alert_id)?.ok_or(SiemError::NotFound("alert"))
        })
    }

    /// Resolving implies acknowledging: an alert resolved straight from the
    /// open state gets its acknowledgement stamps filled as well.
    pub fn resolve(&self, alert_id: &str, analyst: Option<&str>) -> Result<Alert, SiemError> {
        let analyst = analyst.unwrap_or(DEFAULT_ANALYST).to_string();
        self.store.transaction(|tx| {
            let alert = tx.get_alert(alert_id)?.ok_or(SiemError::NotFound("alert"))?;
            if !alert.resolved {
                let now = Utc::now();
                if !alert.acknowledged {
                    tx.mark_acknowledged(alert_id, &analyst, now)?;
                }
                tx.mark_resolved(alert_id, &analyst, now)?;
            }
            tx.get_alert(alert_id)?.ok_or(SiemError::NotFound("alert"))
        })
    }

    pub fn update_notes(&self, alert_id: &str, notes: &str) -> Result<(), SiemError> {
        self.store.transaction(|tx| {
            tx.get_alert(alert_id)?.ok_or(SiemError::NotFound("alert"))?;
            tx.set_notes(alert_id, notes)
        })
    }

    pub fn get(&self, alert_id: &str) -> Result<Option<Alert>, SiemError> {
        self.store.transaction(|tx| tx.get_alert(alert_id))
    }

    /// Alert plus its origin event, for the detail view.
    pub fn get_with_origin(
        &self,
        alert_id: &str,
    ) -> Result<Option<(Alert, Option<LogEvent>)>, SiemError> {
        self.store.transaction(|tx| {
            let Some(alert) = tx.get_alert(alert_id)? else {
                return Ok(None);
            };
            let origin = match alert.log_entry_id {
                Some(id) => tx.get_event(id)?,
                None => None,
            };
            Ok(Some((alert, origin)))
        })
    }

    pub fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, SiemError> {
        self.store.transaction(|tx| tx.list_alerts(filter))
    }

    pub fn statistics(&self) -> Result<AlertStatistics, SiemError> {
        self.store.transaction(|tx| tx.alert_statistics())
    }
}
