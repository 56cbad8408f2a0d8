use std::collections::HashSet;
use std::env;

// Detection defaults, overridable per deployment through the environment
// where an env var is read below.
const DEFAULT_BLACKLIST: &str = "10.0.0.100,192.168.1.200,172.16.0.50";
const DEFAULT_DB_PATH: &str = "logwarden.db";

/// Runtime configuration. Built once in `main` and shared read-only
/// through the request state; nothing here mutates after startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the SQLite database file.
    pub database_path: String,
    pub bind_address: String,
    /// Business hours in 24h UTC, `[start, end)`.
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    pub brute_force_threshold: i64,
    pub brute_force_window_minutes: i64,
    pub ip_blacklist: HashSet<String>,
    pub maxmind_db_path: Option<String>,
    pub alert_retention_days: i64,
}

impl Settings {
    pub fn from_env() -> Self {
        let database_path = env::var("DATABASE_URL")
            .map(|url| strip_sqlite_scheme(&url).to_string())
            .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let bind_address =
            env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let blacklist_raw =
            env::var("IP_BLACKLIST").unwrap_or_else(|_| DEFAULT_BLACKLIST.to_string());

        let maxmind_db_path = env::var("MAXMIND_DB_PATH").ok().filter(|p| !p.is_empty());

        Settings {
            database_path,
            bind_address,
            maxmind_db_path,
            ip_blacklist: parse_blacklist(&blacklist_raw),
            ..Settings::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: DEFAULT_DB_PATH.to_string(),
            bind_address: "0.0.0.0:8000".to_string(),
            business_hours_start: 8,
            business_hours_end: 18,
            brute_force_threshold: 5,
            brute_force_window_minutes: 10,
            ip_blacklist: parse_blacklist(DEFAULT_BLACKLIST),
            maxmind_db_path: None,
            alert_retention_days: 90,
        }
    }
}

/// Accepts both a bare path and a `sqlite://` / `sqlite:///` URL.
fn strip_sqlite_scheme(url: &str) -> &str {
    url.strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .unwrap_or(url)
}

fn parse_blacklist(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_parsing_trims_and_skips_empties() {
        let set = parse_blacklist(" 10.0.0.100, , 192.168.1.200 ,");
        assert_eq!(set.len(), 2);
        assert!(set.contains("10.0.0.100"));
        assert!(set.contains("192.168.1.200"));
    }

    #[test]
    fn sqlite_scheme_is_stripped() {
        assert_eq!(strip_sqlite_scheme("sqlite:///./siem.db"), "./siem.db");
        assert_eq!(strip_sqlite_scheme("sqlite://siem.db"), "siem.db");
        assert_eq!(strip_sqlite_scheme("siem.db"), "siem.db");
    }

    #[test]
    fn defaults_match_detection_documentation() {
        let s = Settings::default();
        assert_eq!(s.brute_force_threshold, 5);
        assert_eq!(s.brute_force_window_minutes, 10);
        assert_eq!(s.business_hours_start, 8);
        assert_eq!(s.business_hours_end, 18);
        assert!(s.ip_blacklist.contains("10.0.0.100"));
    }
}
