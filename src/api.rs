use std::sync::Arc;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::alerts::AlertManager;
use crate::error::SiemError;
use crate::ingest::{IncomingLog, IngestionService};
use crate::models::{Alert, AlertStatistics, LogEvent, Severity};
use crate::store::{AlertFilter, EventFilter, SiemStore};

/// Shared request state, constructed once at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SiemStore>,
    pub ingestor: Arc<IngestionService>,
    pub alerts: Arc<AlertManager>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/logs/single", web::post().to(ingest_single))
            .route("/logs/bulk", web::post().to(ingest_bulk))
            .route("/logs/upload", web::post().to(upload_log_file))
            .route("/logs", web::get().to(search_logs))
            .route("/logs/{log_id}", web::get().to(log_detail))
            .route("/dashboard/stats", web::get().to(dashboard_stats))
            // export must be registered ahead of the {alert_id} matcher
            .route("/alerts/export", web::get().to(export_alerts))
            .route("/alerts", web::get().to(list_alerts))
            .route("/alerts/{alert_id}", web::get().to(alert_detail))
            .route("/alerts/{alert_id}/acknowledge", web::post().to(acknowledge_alert))
            .route("/alerts/{alert_id}/resolve", web::post().to(resolve_alert))
            .route("/alerts/{alert_id}/notes", web::put().to(update_notes)),
    )
    .route("/health", web::get().to(health));
}

// ----- DTOs -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BulkRequest {
    logs: Vec<IncomingLog>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    severity: Option<String>,
    rule_name: Option<String>,
    resolved: Option<bool>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    severity: Option<String>,
    rule_name: Option<String>,
    resolved: Option<bool>,
    format: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    severity: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AnalystQuery {
    analyst: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotesQuery {
    notes: String,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    source_ip: Option<String>,
    username: Option<String>,
    event_type: Option<String>,
    status: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// Alert as returned on listing endpoints: context decoded back to JSON.
#[derive(Debug, Serialize)]
struct AlertDto {
    alert_id: String,
    rule_name: String,
    severity: Severity,
    description: String,
    context: Option<serde_json::Value>,
    source_ip: Option<String>,
    username: Option<String>,
    triggered_at: DateTime<Utc>,
    acknowledged: bool,
    resolved: bool,
}

impl From<Alert> for AlertDto {
    fn from(alert: Alert) -> Self {
        let context = alert
            .context
            .as_deref()
            .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| json!({})));
        AlertDto {
            alert_id: alert.alert_id,
            rule_name: alert.rule_name,
            severity: alert.severity,
            description: alert.description,
            context,
            source_ip: alert.source_ip,
            username: alert.username,
            triggered_at: alert.triggered_at,
            acknowledged: alert.acknowledged,
            resolved: alert.resolved,
        }
    }
}

#[derive(Debug, Serialize)]
struct DashboardStats {
    total_logs: i64,
    alerts_by_severity: AlertStatistics,
    recent_alerts: Vec<AlertDto>,
    total_alerts: i64,
}

// ----- helpers ----------------------------------------------------------

fn parse_severity(raw: Option<&str>) -> Result<Option<Severity>, SiemError> {
    raw.map(str::parse)
        .transpose()
        .map_err(SiemError::BadRequest)
}

/// Dates on query strings: RFC 3339 or a naive ISO datetime (taken as UTC).
fn parse_date(raw: &str) -> Result<DateTime<Utc>, SiemError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    Err(SiemError::BadRequest(format!("invalid date: {}", raw)))
}

fn parse_date_opt(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, SiemError> {
    raw.map(parse_date).transpose()
}

async fn offload<T, F>(f: F) -> Result<T, SiemError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SiemError> + Send + 'static,
{
    web::block(f).await.map_err(|_| SiemError::Canceled)?
}

// ----- ingestion --------------------------------------------------------

async fn ingest_single(
    state: web::Data<AppState>,
    body: web::Json<IncomingLog>,
) -> Result<HttpResponse, SiemError> {
    let ingestor = state.ingestor.clone();
    let log = body.into_inner();
    let report = offload(move || ingestor.ingest_single(&log)).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Log ingested successfully",
        "data": report,
    })))
}

async fn ingest_bulk(
    state: web::Data<AppState>,
    body: web::Json<BulkRequest>,
) -> Result<HttpResponse, SiemError> {
    let ingestor = state.ingestor.clone();
    let logs = body.into_inner().logs;
    let report = offload(move || ingestor.ingest_bulk(&logs)).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": format!("{} logs ingested successfully", report.ingested),
        "data": report,
    })))
}

async fn upload_log_file(
    state: web::Data<AppState>,
    query: web::Query<UploadQuery>,
    body: web::Bytes,
) -> Result<HttpResponse, SiemError> {
    let ingestor = state.ingestor.clone();
    let filename = query.into_inner().filename;
    let report =
        offload(move || ingestor.ingest_file_bytes(&body, filename.as_deref())).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "File uploaded and processed successfully",
        "data": report,
    })))
}

// ----- alerts -----------------------------------------------------------

async fn list_alerts(
    state: web::Data<AppState>,
    query: web::Query<AlertsQuery>,
) -> Result<HttpResponse, SiemError> {
    let query = query.into_inner();
    let filter = AlertFilter {
        severity: parse_severity(query.severity.as_deref())?,
        rule_name: query.rule_name,
        resolved: query.resolved,
        limit: Some(query.limit.unwrap_or(100)),
        offset: query.offset.unwrap_or(0),
        ..AlertFilter::default()
    };

    let alerts = state.alerts.clone();
    let alerts = offload(move || alerts.list(&filter)).await?;
    let dtos: Vec<AlertDto> = alerts.into_iter().map(AlertDto::from).collect();
    let count = dtos.len();
    Ok(HttpResponse::Ok().json(json!({ "alerts": dtos, "count": count })))
}

async fn alert_detail(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, SiemError> {
    let alert_id = path.into_inner();
    let alerts = state.alerts.clone();
    let (alert, origin) = offload(move || alerts.get_with_origin(&alert_id))
        .await?
        .ok_or(SiemError::NotFound("alert"))?;

    let context = alert
        .context
        .as_deref()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| json!({})));

    Ok(HttpResponse::Ok().json(json!({
        "alert_id": alert.alert_id,
        "rule_name": alert.rule_name,
        "severity": alert.severity,
        "description": alert.description,
        "context": context,
        "source_ip": alert.source_ip,
        "username": alert.username,
        "triggered_at": alert.triggered_at.to_rfc3339(),
        "acknowledged": alert.acknowledged,
        "acknowledged_by": alert.acknowledged_by,
        "acknowledged_at": alert.acknowledged_at.map(|t| t.to_rfc3339()),
        "resolved": alert.resolved,
        "resolved_by": alert.resolved_by,
        "resolved_at": alert.resolved_at.map(|t| t.to_rfc3339()),
        "notes": alert.notes,
        "log_entry": origin.map(|e| json!({
            "id": e.id,
            "timestamp": e.timestamp.to_rfc3339(),
            "raw_log": e.raw_log,
            "country_code": e.country_code,
        })),
    })))
}

async fn acknowledge_alert(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<AnalystQuery>,
) -> Result<HttpResponse, SiemError> {
    let alert_id = path.into_inner();
    let analyst = query.into_inner().analyst;
    let alerts = state.alerts.clone();
    offload(move || alerts.acknowledge(&alert_id, analyst.as_deref())).await?;
    Ok(HttpResponse::Ok().json(json!({ "status": "success", "message": "Alert acknowledged" })))
}

async fn resolve_alert(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<AnalystQuery>,
) -> Result<HttpResponse, SiemError> {
    let alert_id = path.into_inner();
    let analyst = query.into_inner().analyst;
    let alerts = state.alerts.clone();
    offload(move || alerts.resolve(&alert_id, analyst.as_deref())).await?;
    Ok(HttpResponse::Ok().json(json!({ "status": "success", "message": "Alert resolved" })))
}

async fn update_notes(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<NotesQuery>,
) -> Result<HttpResponse, SiemError> {
    let alert_id = path.into_inner();
    let notes = query.into_inner().notes;
    let alerts = state.alerts.clone();
    offload(move || alerts.update_notes(&alert_id, &notes)).await?;
    Ok(HttpResponse::Ok().json(json!({ "status": "success", "message": "Notes updated" })))
}

async fn export_alerts(
    state: web::Data<AppState>,
    query: web::Query<ExportQuery>,
) -> Result<HttpResponse, SiemError> {
    let query = query.into_inner();
    let format = query.format.as_deref().unwrap_or("csv");
    if format != "csv" && format != "json" {
        return Err(SiemError::BadRequest(format!(
            "unsupported export format: {}",
            format
        )));
    }

    let filter = AlertFilter {
        severity: parse_severity(query.severity.as_deref())?,
        rule_name: query.rule_name,
        resolved: query.resolved,
        triggered_after: parse_date_opt(query.start_date.as_deref())?,
        triggered_before: parse_date_opt(query.end_date.as_deref())?,
        limit: None,
        offset: 0,
    };

    let alerts = state.alerts.clone();
    let alerts = offload(move || alerts.list(&filter)).await?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");

    if format == "csv" {
        let body = render_csv(&alerts)?;
        Ok(HttpResponse::Ok()
            .content_type("text/csv")
            .insert_header((
                "Content-Disposition",
                format!("attachment; filename=alerts_export_{}.csv", stamp),
            ))
            .body(body))
    } else {
        let dtos: Vec<AlertDto> = alerts.into_iter().map(AlertDto::from).collect();
        let body = serde_json::to_string_pretty(&dtos)?;
        Ok(HttpResponse::Ok()
            .content_type("application/json")
            .insert_header((
                "Content-Disposition",
                format!("attachment; filename=alerts_export_{}.json", stamp),
            ))
            .body(body))
    }
}

fn render_csv(alerts: &[Alert]) -> Result<String, SiemError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "Alert ID",
        "Rule Name",
        "Severity",
        "Description",
        "Source IP",
        "Username",
        "Triggered At",
        "Acknowledged",
        "Resolved",
    ])?;
    for alert in alerts {
        writer.write_record([
            alert.alert_id.as_str(),
            alert.rule_name.as_str(),
            alert.severity.as_str(),
            alert.description.as_str(),
            alert.source_ip.as_deref().unwrap_or(""),
            alert.username.as_deref().unwrap_or(""),
            &alert.triggered_at.to_rfc3339(),
            &alert.acknowledged.to_string(),
            &alert.resolved.to_string(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| SiemError::BadRequest(format!("export failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| SiemError::BadRequest(format!("export failed: {}", e)))
}

// ----- events -----------------------------------------------------------

async fn search_logs(
    state: web::Data<AppState>,
    query: web::Query<LogsQuery>,
) -> Result<HttpResponse, SiemError> {
    let query = query.into_inner();
    let filter = EventFilter {
        source_ip: query.source_ip,
        username: query.username,
        event_type: query.event_type,
        status: query.status,
        start: parse_date_opt(query.start_date.as_deref())?,
        end: parse_date_opt(query.end_date.as_deref())?,
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
    };

    let store = state.store.clone();
    let limit = filter.limit;
    let offset = filter.offset;
    let (logs, total): (Vec<LogEvent>, i64) =
        offload(move || store.transaction(|tx| tx.search_events(&filter))).await?;

    Ok(HttpResponse::Ok().json(json!({
        "logs": logs,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

async fn log_detail(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, SiemError> {
    let id = path.into_inner();
    let store = state.store.clone();
    let event = offload(move || store.transaction(|tx| tx.get_event(id)))
        .await?
        .ok_or(SiemError::NotFound("log entry"))?;
    Ok(HttpResponse::Ok().json(event))
}

// ----- dashboard & health ----------------------------------------------

async fn dashboard_stats(
    state: web::Data<AppState>,
    query: web::Query<StatsQuery>,
) -> Result<HttpResponse, SiemError> {
    let query = query.into_inner();
    let severity = parse_severity(query.severity.as_deref())?;
    let limit = query.limit.unwrap_or(50);

    let store = state.store.clone();
    let alerts = state.alerts.clone();
    let stats = offload(move || {
        let total_logs = store.transaction(|tx| tx.count_events())?;
        let alerts_by_severity = alerts.statistics()?;
        let recent = alerts.list(&AlertFilter {
            severity,
            resolved: Some(false),
            limit: Some(limit),
            ..AlertFilter::default()
        })?;
        Ok(DashboardStats {
            total_logs,
            total_alerts: alerts_by_severity.total,
            alerts_by_severity,
            recent_alerts: recent.into_iter().map(AlertDto::from).collect(),
        })
    })
    .await?;

    Ok(HttpResponse::Ok().json(stats))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok", "service": "logwarden" }))
}
