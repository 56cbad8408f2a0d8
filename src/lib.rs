//! Lightweight SIEM service.
//!
//! Ingests authentication and access log lines, normalizes them into a
//! uniform event schema, persists them, evaluates a fixed set of
//! correlation rules against each event, and manages deduplicated alerts
//! through their open -> acknowledged -> resolved lifecycle.

pub mod alerts;
pub mod api;
pub mod config;
pub mod detector;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod rules;
pub mod store;

// Public surface for embedding and for the binary.
pub use alerts::AlertManager;
pub use config::Settings;
pub use detector::DetectionEngine;
pub use error::SiemError;
pub use geo::{GeoLocator, LocationResolver};
pub use ingest::{IncomingLog, IngestionService};
pub use models::{Alert, LogEvent, Severity};
pub use parser::LogParser;
pub use store::SiemStore;
