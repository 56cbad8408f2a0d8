use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};

use crate::error::SiemError;
use crate::models::{Alert, AlertStatistics, LogEvent, NewAlert, NewLogEvent, Severity};

/// SQLite-backed store for events and alerts.
///
/// All access goes through [`SiemStore::transaction`]: the connection is
/// locked for the duration of the closure and the transaction commits only
/// when the closure succeeds, so a failing batch rolls back as a unit and
/// in-batch queries observe earlier in-batch inserts.
pub struct SiemStore {
    conn: Mutex<Connection>,
}

/// Transactional view handed to store callers.
pub struct StoreTx<'a> {
    tx: &'a Transaction<'a>,
}

/// Filter for alert listing and export.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub rule_name: Option<String>,
    pub resolved: Option<bool>,
    pub triggered_after: Option<DateTime<Utc>>,
    pub triggered_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: i64,
}

/// Filter for event search.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub source_ip: Option<String>,
    pub username: Option<String>,
    pub event_type: Option<String>,
    pub status: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EventFilter {
    fn default() -> Self {
        EventFilter {
            source_ip: None,
            username: None,
            event_type: None,
            status: None,
            start: None,
            end: None,
            limit: 100,
            offset: 0,
        }
    }
}

// Timestamps are persisted as UTC epoch milliseconds so that window
// comparisons are plain integer comparisons.
fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

impl SiemStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SiemStore, SiemError> {
        let conn = Connection::open(path)?;
        let store = SiemStore { conn: Mutex::new(conn) };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory database, used by the test suites.
    pub fn in_memory() -> Result<SiemStore, SiemError> {
        let conn = Connection::open_in_memory()?;
        let store = SiemStore { conn: Mutex::new(conn) };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), SiemError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Run `f` inside a single transaction. Commits on `Ok`, rolls back
    /// (via drop) on `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&StoreTx<'_>) -> Result<T, SiemError>,
    ) -> Result<T, SiemError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&StoreTx { tx: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    /// Drop alerts older than the retention horizon, plus events past the
    /// horizon that no surviving alert references. Returns
    /// `(alerts_deleted, events_deleted)`.
    pub fn prune_expired(&self, retention_days: i64) -> Result<(usize, usize), SiemError> {
        let cutoff = to_millis(Utc::now() - chrono::Duration::days(retention_days));
        self.transaction(|store| {
            let alerts = store
                .tx
                .execute("DELETE FROM alerts WHERE triggered_at < ?1", params![cutoff])?;
            let events = store.tx.execute(
                "DELETE FROM log_entries
                 WHERE timestamp < ?1
                   AND id NOT IN (
                       SELECT log_entry_id FROM alerts WHERE log_entry_id IS NOT NULL
                   )",
                params![cutoff],
            )?;
            Ok((alerts, events))
        })
    }
}

impl StoreTx<'_> {
    // ----- events -------------------------------------------------------

    /// Insert an event and return it with its assigned id. The returned
    /// timestamp is the stored (millisecond) value so that in-batch window
    /// queries and the caller agree on it.
    pub fn insert_event(&self, event: &NewLogEvent) -> Result<LogEvent, SiemError> {
        let now = Utc::now();
        let ts = to_millis(event.timestamp);
        self.tx.execute(
            "INSERT INTO log_entries
             (timestamp, source_ip, username, event_type, status, raw_log,
              source_file, country_code, latitude, longitude, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                ts,
                event.source_ip,
                event.username,
                event.event_type,
                event.status,
                event.raw_log,
                event.source_file,
                event.country_code,
                event.latitude,
                event.longitude,
                to_millis(now),
            ],
        )?;
        Ok(LogEvent {
            id: self.tx.last_insert_rowid(),
            timestamp: from_millis(ts),
            source_ip: event.source_ip.clone(),
            username: event.username.clone(),
            event_type: event.event_type.clone(),
            status: event.status.clone(),
            raw_log: event.raw_log.clone(),
            source_file: event.source_file.clone(),
            country_code: event.country_code.clone(),
            latitude: event.latitude,
            longitude: event.longitude,
            created_at: from_millis(to_millis(now)),
        })
    }

    pub fn get_event(&self, id: i64) -> Result<Option<LogEvent>, SiemError> {
        let event = self
            .tx
            .query_row(
                &format!("SELECT {} FROM log_entries WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Failed-login count for one IP within `[from, to]`, inclusive.
    pub fn count_failed_logins(
        &self,
        source_ip: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, SiemError> {
        let count = self.tx.query_row(
            "SELECT COUNT(*) FROM log_entries
             WHERE source_ip = ?1
               AND status = 'failed'
               AND event_type = 'login'
               AND timestamp >= ?2
               AND timestamp <= ?3",
            params![source_ip, to_millis(from), to_millis(to)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Most recent successful login for `username` in `[from, before)` from
    /// a different IP that carries coordinates.
    pub fn previous_located_login(
        &self,
        username: &str,
        from: DateTime<Utc>,
        before: DateTime<Utc>,
        exclude_ip: &str,
    ) -> Result<Option<LogEvent>, SiemError> {
        let event = self
            .tx
            .query_row(
                &format!(
                    "SELECT {} FROM log_entries
                     WHERE username = ?1
                       AND status = 'success'
                       AND event_type = 'login'
                       AND timestamp >= ?2
                       AND timestamp < ?3
                       AND source_ip <> ?4
                       AND latitude IS NOT NULL
                     ORDER BY timestamp DESC, id DESC
                     LIMIT 1",
                    EVENT_COLUMNS
                ),
                params![username, to_millis(from), to_millis(before), exclude_ip],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    pub fn count_events(&self) -> Result<i64, SiemError> {
        let count = self
            .tx
            .query_row("SELECT COUNT(*) FROM log_entries", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Filtered event search: `(page, total)`, newest first.
    pub fn search_events(&self, filter: &EventFilter) -> Result<(Vec<LogEvent>, i64), SiemError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(ip) = &filter.source_ip {
            clauses.push("source_ip = ?");
            values.push(Value::Text(ip.clone()));
        }
        if let Some(user) = &filter.username {
            clauses.push("username = ?");
            values.push(Value::Text(user.clone()));
        }
        if let Some(event_type) = &filter.event_type {
            clauses.push("event_type = ?");
            values.push(Value::Text(event_type.clone()));
        }
        if let Some(status) = &filter.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.clone()));
        }
        if let Some(start) = filter.start {
            clauses.push("timestamp >= ?");
            values.push(Value::Integer(to_millis(start)));
        }
        if let Some(end) = filter.end {
            clauses.push("timestamp <= ?");
            values.push(Value::Integer(to_millis(end)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = self.tx.query_row(
            &format!("SELECT COUNT(*) FROM log_entries{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(filter.limit));
        values.push(Value::Integer(filter.offset));
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM log_entries{} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            EVENT_COLUMNS, where_sql
        ))?;
        let events = stmt
            .query_map(params_from_iter(values.iter()), event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((events, total))
    }

    // ----- alerts -------------------------------------------------------

    pub fn insert_alert(&self, alert: &NewAlert) -> Result<Alert, SiemError> {
        self.tx.execute(
            "INSERT INTO alerts
             (alert_id, rule_name, severity, description, context,
              source_ip, username, log_entry_id, triggered_at,
              acknowledged, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0)",
            params![
                alert.alert_id,
                alert.rule_name,
                alert.severity.as_str(),
                alert.description,
                alert.context,
                alert.source_ip,
                alert.username,
                alert.log_entry_id,
                to_millis(alert.triggered_at),
            ],
        )?;
        Ok(Alert {
            id: self.tx.last_insert_rowid(),
            alert_id: alert.alert_id.clone(),
            rule_name: alert.rule_name.clone(),
            severity: alert.severity,
            description: alert.description.clone(),
            context: alert.context.clone(),
            source_ip: alert.source_ip.clone(),
            username: alert.username.clone(),
            log_entry_id: alert.log_entry_id,
            triggered_at: from_millis(to_millis(alert.triggered_at)),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            notes: None,
        })
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>, SiemError> {
        let alert = self
            .tx
            .query_row(
                &format!("SELECT {} FROM alerts WHERE alert_id = ?1", ALERT_COLUMNS),
                params![alert_id],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    /// Dedup probe: does an unresolved alert for `rule_name` exist, keyed by
    /// IP and/or username, triggered at or after `since`?
    pub fn has_open_alert(
        &self,
        rule_name: &str,
        source_ip: Option<&str>,
        username: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<bool, SiemError> {
        let mut sql = String::from(
            "SELECT 1 FROM alerts
             WHERE rule_name = ? AND resolved = 0 AND triggered_at >= ?",
        );
        let mut values: Vec<Value> = vec![
            Value::Text(rule_name.to_string()),
            Value::Integer(to_millis(since)),
        ];
        if let Some(ip) = source_ip {
            sql.push_str(" AND source_ip = ?");
            values.push(Value::Text(ip.to_string()));
        }
        if let Some(user) = username {
            sql.push_str(" AND username = ?");
            values.push(Value::Text(user.to_string()));
        }
        sql.push_str(" LIMIT 1");

        let hit = self
            .tx
            .query_row(&sql, params_from_iter(values.iter()), |_| Ok(()))
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, SiemError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(severity) = filter.severity {
            clauses.push("severity = ?");
            values.push(Value::Text(severity.as_str().to_string()));
        }
        if let Some(rule_name) = &filter.rule_name {
            clauses.push("rule_name = ?");
            values.push(Value::Text(rule_name.clone()));
        }
        if let Some(resolved) = filter.resolved {
            clauses.push("resolved = ?");
            values.push(Value::Integer(resolved as i64));
        }
        if let Some(after) = filter.triggered_after {
            clauses.push("triggered_at >= ?");
            values.push(Value::Integer(to_millis(after)));
        }
        if let Some(before) = filter.triggered_before {
            clauses.push("triggered_at <= ?");
            values.push(Value::Integer(to_millis(before)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let mut sql = format!(
            "SELECT {} FROM alerts{} ORDER BY triggered_at DESC, id DESC",
            ALERT_COLUMNS, where_sql
        );
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(limit));
            values.push(Value::Integer(filter.offset));
        }

        let mut stmt = self.tx.prepare(&sql)?;
        let alerts = stmt
            .query_map(params_from_iter(values.iter()), alert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    pub fn alert_statistics(&self) -> Result<AlertStatistics, SiemError> {
        let mut stmt = self.tx.prepare(
            "SELECT severity, COUNT(*) FROM alerts
             WHERE resolved = 0 GROUP BY severity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = AlertStatistics::default();
        for row in rows {
            let (severity, count) = row?;
            match severity.parse::<Severity>() {
                Ok(Severity::Critical) => stats.critical = count,
                Ok(Severity::High) => stats.high = count,
                Ok(Severity::Medium) => stats.medium = count,
                Ok(Severity::Low) => stats.low = count,
                Err(_) => continue,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    pub fn mark_acknowledged(
        &self,
        alert_id: &str,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SiemError> {
        self.tx.execute(
            "UPDATE alerts
             SET acknowledged = 1, acknowledged_by = ?2, acknowledged_at = ?3
             WHERE alert_id = ?1",
            params![alert_id, by, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn mark_resolved(
        &self,
        alert_id: &str,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SiemError> {
        self.tx.execute(
            "UPDATE alerts
             SET resolved = 1, acknowledged = 1, resolved_by = ?2, resolved_at = ?3
             WHERE alert_id = ?1",
            params![alert_id, by, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn set_notes(&self, alert_id: &str, notes: &str) -> Result<(), SiemError> {
        self.tx.execute(
            "UPDATE alerts SET notes = ?2 WHERE alert_id = ?1",
            params![alert_id, notes],
        )?;
        Ok(())
    }
}

const EVENT_COLUMNS: &str = "id, timestamp, source_ip, username, event_type, status, \
     raw_log, source_file, country_code, latitude, longitude, created_at";

const ALERT_COLUMNS: &str = "id, alert_id, rule_name, severity, description, context, \
     source_ip, username, log_entry_id, triggered_at, acknowledged, acknowledged_by, \
     acknowledged_at, resolved, resolved_by, resolved_at, notes";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<LogEvent> {
    Ok(LogEvent {
        id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        source_ip: row.get(2)?,
        username: row.get(3)?,
        event_type: row.get(4)?,
        status: row.get(5)?,
        raw_log: row.get(6)?,
        source_file: row.get(7)?,
        country_code: row.get(8)?,
        latitude: row.get(9)?,
        longitude: row.get(10)?,
        created_at: from_millis(row.get(11)?),
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let severity: String = row.get(3)?;
    let severity = severity.parse::<Severity>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(Alert {
        id: row.get(0)?,
        alert_id: row.get(1)?,
        rule_name: row.get(2)?,
        severity,
        description: row.get(4)?,
        context: row.get(5)?,
        source_ip: row.get(6)?,
        username: row.get(7)?,
        log_entry_id: row.get(8)?,
        triggered_at: from_millis(row.get(9)?),
        acknowledged: row.get(10)?,
        acknowledged_by: row.get(11)?,
        acknowledged_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        resolved: row.get(13)?,
        resolved_by: row.get(14)?,
        resolved_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
        notes: row.get(16)?,
    })
}
