use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde_json::{json, Map};

use crate::config::Settings;
use crate::error::SiemError;
use crate::geo::{haversine_km, LocationResolver};
use crate::models::{Finding, LogEvent, Severity};
use crate::store::StoreTx;

pub const RULE_BRUTE_FORCE: &str = "brute_force_login";
pub const RULE_IMPOSSIBLE_TRAVEL: &str = "impossible_travel";
pub const RULE_OFF_HOURS: &str = "login_outside_business_hours";
pub const RULE_PRIVILEGE_ESCALATION: &str = "privilege_escalation";
pub const RULE_BLACKLISTED_IP: &str = "blacklisted_ip";

// Impossible-travel tuning. 800 km/h is a loaded commercial aircraft;
// anything faster over >= 1000 km is treated as two different people.
const TRAVEL_LOOKBACK_HOURS: i64 = 1;
const MIN_TRAVEL_DISTANCE_KM: f64 = 1000.0;
const MAX_PLAUSIBLE_SPEED_KMH: f64 = 800.0;

const ESCALATION_DEDUP_MINUTES: i64 = 30;
const ESCALATION_EVENT_TYPES: &[&str] = &["privilege_escalation", "admin_access", "sudo", "su"];
const ESCALATION_KEYWORDS: &[&str] = &[
    "sudo",
    "su",
    "admin",
    "root",
    "elevate",
    "privilege",
    "runas",
    "impersonate",
    "escalate",
];

const RAW_LOG_SNIPPET_CHARS: usize = 500;

/// Everything a rule may consult: configuration, the location resolver and
/// the transaction the triggering event was inserted in.
pub struct RuleCtx<'a> {
    pub settings: &'a Settings,
    pub resolver: &'a dyn LocationResolver,
    pub tx: &'a StoreTx<'a>,
}

pub type RuleCheck = fn(&RuleCtx<'_>, &LogEvent) -> Result<Option<Finding>, SiemError>;

/// A detection rule as a value: stable name, severity, check function.
pub struct RuleDef {
    pub name: &'static str,
    pub severity: Severity,
    pub check: RuleCheck,
}

/// All rules, in evaluation order.
pub const RULES: &[RuleDef] = &[
    RuleDef { name: RULE_BRUTE_FORCE, severity: Severity::High, check: check_brute_force },
    RuleDef { name: RULE_IMPOSSIBLE_TRAVEL, severity: Severity::Critical, check: check_impossible_travel },
    RuleDef { name: RULE_OFF_HOURS, severity: Severity::Medium, check: check_off_hours },
    RuleDef { name: RULE_PRIVILEGE_ESCALATION, severity: Severity::High, check: check_privilege_escalation },
    RuleDef { name: RULE_BLACKLISTED_IP, severity: Severity::Critical, check: check_blacklisted_ip },
];

/// Weekdays within `[start, end)` UTC. Saturday and Sunday never count.
pub fn is_business_hours(t: DateTime<Utc>, start: u32, end: u32) -> bool {
    if matches!(t.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let hour = t.hour();
    start <= hour && hour < end
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn snippet(raw: &str) -> String {
    raw.chars().take(RAW_LOG_SNIPPET_CHARS).collect()
}

/// Repeated failed logins from one IP inside the configured window.
fn check_brute_force(ctx: &RuleCtx<'_>, event: &LogEvent) -> Result<Option<Finding>, SiemError> {
    if event.event_type != "login" || event.status != "failed" || event.source_ip.is_empty() {
        return Ok(None);
    }

    let window_minutes = ctx.settings.brute_force_window_minutes;
    let window_start = event.timestamp - Duration::minutes(window_minutes);
    let failed = ctx
        .tx
        .count_failed_logins(&event.source_ip, window_start, event.timestamp)?;
    if failed < ctx.settings.brute_force_threshold {
        return Ok(None);
    }

    if ctx
        .tx
        .has_open_alert(RULE_BRUTE_FORCE, Some(&event.source_ip), None, window_start)?
    {
        return Ok(None);
    }

    let mut context = Map::new();
    context.insert("source_ip".to_string(), json!(event.source_ip));
    context.insert("failed_attempts".to_string(), json!(failed));
    context.insert("time_window_minutes".to_string(), json!(window_minutes));
    let affected: Vec<&str> = if event.username.is_empty() {
        vec![]
    } else {
        vec![event.username.as_str()]
    };
    context.insert("affected_users".to_string(), json!(affected));

    Ok(Some(Finding {
        description: format!(
            "Brute-force login attempt detected from {}. {} failed attempts in {} minutes.",
            event.source_ip, failed, window_minutes
        ),
        context,
    }))
}

/// Two successful logins for one user whose separation could not be covered
/// at a plausible travel speed.
fn check_impossible_travel(
    ctx: &RuleCtx<'_>,
    event: &LogEvent,
) -> Result<Option<Finding>, SiemError> {
    if event.event_type != "login" || event.status != "success" {
        return Ok(None);
    }
    if event.username.is_empty() || event.source_ip.is_empty() {
        return Ok(None);
    }

    let Some(current) = ctx.resolver.get_location(&event.source_ip) else {
        return Ok(None);
    };
    let (Some(cur_lat), Some(cur_lon)) = (current.latitude, current.longitude) else {
        return Ok(None);
    };

    let window_start = event.timestamp - Duration::hours(TRAVEL_LOOKBACK_HOURS);
    let Some(previous) = ctx.tx.previous_located_login(
        &event.username,
        window_start,
        event.timestamp,
        &event.source_ip,
    )?
    else {
        return Ok(None);
    };
    let (Some(prev_lat), Some(prev_lon)) = (previous.latitude, previous.longitude) else {
        return Ok(None);
    };

    let distance_km = haversine_km(prev_lat, prev_lon, cur_lat, cur_lon);
    let elapsed_hours =
        (event.timestamp - previous.timestamp).num_milliseconds() as f64 / 3_600_000.0;
    let min_required_hours = distance_km / MAX_PLAUSIBLE_SPEED_KMH;

    if distance_km < MIN_TRAVEL_DISTANCE_KM || elapsed_hours >= min_required_hours {
        return Ok(None);
    }

    if ctx
        .tx
        .has_open_alert(RULE_IMPOSSIBLE_TRAVEL, None, Some(&event.username), window_start)?
    {
        return Ok(None);
    }

    let prev_country = previous.country_code.as_deref().unwrap_or("??");
    let cur_country = current.country_code.as_deref().unwrap_or("??");
    let mut context = Map::new();
    context.insert("username".to_string(), json!(event.username));
    context.insert("previous_ip".to_string(), json!(previous.source_ip));
    context.insert(
        "previous_location".to_string(),
        json!(format!("{} ({}, {})", prev_country, prev_lat, prev_lon)),
    );
    context.insert("current_ip".to_string(), json!(event.source_ip));
    context.insert(
        "current_location".to_string(),
        json!(format!("{} ({}, {})", cur_country, cur_lat, cur_lon)),
    );
    context.insert("distance_km".to_string(), json!(round2(distance_km)));
    context.insert("time_hours".to_string(), json!(round2(elapsed_hours)));
    context.insert(
        "previous_timestamp".to_string(),
        json!(previous.timestamp.to_rfc3339()),
    );

    Ok(Some(Finding {
        description: format!(
            "Impossible travel detected for user {}. Login from {} ({}) to {} ({}) covering {:.0} km in {:.2} hours.",
            event.username, previous.source_ip, prev_country, event.source_ip, cur_country,
            distance_km, elapsed_hours
        ),
        context,
    }))
}

/// Successful weekday logins outside the configured business hours.
/// Weekend logins are deliberately not alerted.
fn check_off_hours(ctx: &RuleCtx<'_>, event: &LogEvent) -> Result<Option<Finding>, SiemError> {
    if event.event_type != "login" || event.status != "success" {
        return Ok(None);
    }

    let start = ctx.settings.business_hours_start;
    let end = ctx.settings.business_hours_end;
    if is_business_hours(event.timestamp, start, end) {
        return Ok(None);
    }
    if matches!(event.timestamp.weekday(), Weekday::Sat | Weekday::Sun) {
        return Ok(None);
    }

    let since = event.timestamp - Duration::hours(1);
    if ctx.tx.has_open_alert(
        RULE_OFF_HOURS,
        Some(&event.source_ip),
        Some(&event.username),
        since,
    )? {
        return Ok(None);
    }

    let mut context = Map::new();
    context.insert("username".to_string(), json!(event.username));
    context.insert("source_ip".to_string(), json!(event.source_ip));
    context.insert("login_time".to_string(), json!(event.timestamp.to_rfc3339()));
    context.insert(
        "business_hours".to_string(),
        json!(format!("{}:00 - {}:00", start, end)),
    );
    context.insert(
        "day_of_week".to_string(),
        json!(event.timestamp.format("%A").to_string()),
    );

    Ok(Some(Finding {
        description: format!(
            "Login outside business hours detected for user {} from {} at {} (Business hours: {}:00 - {}:00).",
            event.username,
            event.source_ip,
            event.timestamp.format("%H:%M"),
            start,
            end
        ),
        context,
    }))
}

/// Privilege-change event types alert unconditionally; escalation keywords
/// in the raw line alert with a 30-minute per-user dedup window.
fn check_privilege_escalation(
    ctx: &RuleCtx<'_>,
    event: &LogEvent,
) -> Result<Option<Finding>, SiemError> {
    if ESCALATION_EVENT_TYPES.contains(&event.event_type.as_str()) {
        let mut context = Map::new();
        context.insert("username".to_string(), json!(event.username));
        context.insert("source_ip".to_string(), json!(event.source_ip));
        context.insert("event_type".to_string(), json!(event.event_type));
        context.insert("status".to_string(), json!(event.status));
        context.insert("raw_log".to_string(), json!(snippet(&event.raw_log)));
        return Ok(Some(Finding {
            description: format!(
                "Privilege escalation attempt detected for user {} from {}",
                event.username, event.source_ip
            ),
            context,
        }));
    }

    let raw_lower = event.raw_log.to_lowercase();
    let Some(keyword) = ESCALATION_KEYWORDS.iter().find(|kw| raw_lower.contains(*kw)) else {
        return Ok(None);
    };

    let since = event.timestamp - Duration::minutes(ESCALATION_DEDUP_MINUTES);
    if ctx
        .tx
        .has_open_alert(RULE_PRIVILEGE_ESCALATION, None, Some(&event.username), since)?
    {
        return Ok(None);
    }

    let mut context = Map::new();
    context.insert("username".to_string(), json!(event.username));
    context.insert("source_ip".to_string(), json!(event.source_ip));
    context.insert("keyword".to_string(), json!(keyword));
    context.insert("event_type".to_string(), json!(event.event_type));
    context.insert("status".to_string(), json!(event.status));
    context.insert("raw_log".to_string(), json!(snippet(&event.raw_log)));

    Ok(Some(Finding {
        description: format!(
            "Potential privilege escalation detected for user {} from {}. Keyword: {}",
            event.username, event.source_ip, keyword
        ),
        context,
    }))
}

/// Any activity from an address on the configured blacklist.
fn check_blacklisted_ip(ctx: &RuleCtx<'_>, event: &LogEvent) -> Result<Option<Finding>, SiemError> {
    if event.source_ip.is_empty() || !ctx.settings.ip_blacklist.contains(&event.source_ip) {
        return Ok(None);
    }

    let since = event.timestamp - Duration::hours(1);
    if ctx
        .tx
        .has_open_alert(RULE_BLACKLISTED_IP, Some(&event.source_ip), None, since)?
    {
        return Ok(None);
    }

    let mut context = Map::new();
    context.insert("source_ip".to_string(), json!(event.source_ip));
    context.insert("username".to_string(), json!(event.username));
    context.insert("event_type".to_string(), json!(event.event_type));
    context.insert("status".to_string(), json!(event.status));
    context.insert("country_code".to_string(), json!(event.country_code));
    context.insert("raw_log".to_string(), json!(snippet(&event.raw_log)));

    Ok(Some(Finding {
        description: format!(
            "Activity detected from blacklisted IP address: {}",
            event.source_ip
        ),
        context,
    }))
}
