//! # RADOS Gateway Usage Exporter
//!
//! Polls the Ceph RADOS Gateway admin API for operation usage, bucket and
//! user quota statistics and republishes them as Prometheus metrics.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        RADOSGW USAGE EXPORTER                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ADMIN API (SigV4) → RESOURCE SCRAPERS → SNAPSHOT SLOTS → /metrics        │
//! │                         ops | buckets | users                             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every collector runs its own fixed-interval loop. A cycle fetches raw stats,
//! folds them into metric records and swaps the result into the collector's
//! snapshot slot. The `/metrics` handler only ever clones the current snapshot
//! pointer, so readers and writers never wait on each other's I/O.
//!
//! ## Features
//!
//! - **Signed**: AWS Signature V4 on every admin request
//! - **Deduplicating**: duplicate usage rows are summed per (owner, bucket, category)
//! - **Stale over empty**: a failed cycle keeps the last good snapshot
//! - **Self-accounting**: per-collector scrape duration and success/error counts

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use futures::future::join_all;
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::{Client as HttpClient, Url};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

// ----------------------------------------------------------------------------
// Request Signing
// ----------------------------------------------------------------------------
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Configuration & Validation
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use validator::{Validate, ValidationError};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::core::{Collector as PrometheusCollector, Desc};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry as PrometheusRegistry, TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "radosgw-exporter";
pub const EXPORTER_FULL_NAME: &str = "RADOS Gateway Usage Exporter";

// ----------------------------------------------------------------------------
// Metric Naming
// ----------------------------------------------------------------------------

/// Prefix shared by every series this exporter publishes.
pub const METRIC_NAMESPACE: &str = "radosgw_usage";

/// Storage category that carries a bucket's primary usage counters.
pub const MAIN_USAGE_CATEGORY: &str = "rgw.main";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

pub const DEFAULT_SCRAPE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
pub const CONNECT_TIMEOUT_SECS: u64 = 15;
pub const TCP_KEEPALIVE_SECS: u64 = 30;
pub const POOL_IDLE_TIMEOUT_SECS: u64 = 10;
pub const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 100;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_REGION: &str = "us-east-1";
pub const ENV_PREFIX: &str = "RGW_EXPORTER_";

pub const USAGE_PATH: &str = "admin/usage";
pub const BUCKET_PATH: &str = "admin/bucket";
pub const USER_PATH: &str = "admin/user";
pub const HEALTHCHECK_PATH: &str = "swift/healthcheck";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Series definitions, metric records and the snapshot slot that carries them
// from a collector's scrape loop to the exposition endpoint.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Millisecond Wall-Clock Time
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in milliseconds since the Unix epoch, the resolution
/// the Prometheus exposition format carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[inline]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Series Definitions
// ----------------------------------------------------------------------------

/// Prometheus value type of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesKind {
    Counter,
    Gauge,
}

impl SeriesKind {
    fn metric_type(&self) -> MetricType {
        match self {
            SeriesKind::Counter => MetricType::COUNTER,
            SeriesKind::Gauge => MetricType::GAUGE,
        }
    }
}

/// Static description of one metric series: its name, help text, type and
/// the ordered label names every record of the series carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesDef {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: SeriesKind,
    pub labels: &'static [&'static str],
}

impl SeriesDef {
    /// Build the registry descriptor for this series.
    pub fn desc(&self) -> prometheus::Result<Desc> {
        Desc::new(
            self.name.to_string(),
            self.help.to_string(),
            self.labels.iter().map(|label| label.to_string()).collect(),
            HashMap::new(),
        )
    }

    fn empty_family(&self) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(self.name.to_string());
        family.set_help(self.help.to_string());
        family.set_field_type(self.kind.metric_type());
        family
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Records
// ----------------------------------------------------------------------------

/// Label values, positionally aligned with [`SeriesDef::labels`].
/// No series carries more than three labels.
pub type LabelValues = SmallVec<[CompactString; 3]>;

/// One fully-formed sample: series, label values, value and scrape time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub series: &'static SeriesDef,
    pub labels: LabelValues,
    pub value: f64,
    pub timestamp: Timestamp,
}

impl MetricRecord {
    pub fn new(series: &'static SeriesDef, labels: &[&str], value: f64, timestamp: Timestamp) -> Self {
        debug_assert_eq!(series.labels.len(), labels.len(), "label arity mismatch for {}", series.name);
        Self {
            series,
            labels: labels.iter().map(|value| CompactString::from(*value)).collect(),
            value,
            timestamp,
        }
    }

    /// Look up a label value by label name.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.series
            .labels
            .iter()
            .position(|name| *name == key)
            .and_then(|idx| self.labels.get(idx))
            .map(|value| value.as_str())
    }

    fn matches(&self, name: &str, labels: &[&str]) -> bool {
        self.series.name == name
            && self.labels.len() == labels.len()
            && self.labels.iter().zip(labels).all(|(have, want)| have.as_str() == *want)
    }

    fn to_proto(&self) -> proto::Metric {
        let mut metric = proto::Metric::default();
        for (name, value) in self.series.labels.iter().zip(self.labels.iter()) {
            let mut pair = LabelPair::default();
            pair.set_name(name.to_string());
            pair.set_value(value.to_string());
            metric.mut_label().push(pair);
        }
        match self.series.kind {
            SeriesKind::Counter => {
                let mut counter = proto::Counter::default();
                counter.set_value(self.value);
                metric.set_counter(counter);
            }
            SeriesKind::Gauge => {
                let mut gauge = proto::Gauge::default();
                gauge.set_value(self.value);
                metric.set_gauge(gauge);
            }
        }
        metric.set_timestamp_ms(self.timestamp.as_millis());
        metric
    }
}

// ----------------------------------------------------------------------------
// 3.4 Metric Snapshot
// ----------------------------------------------------------------------------

/// Immutable result of one successful scrape cycle.
///
/// Published wholesale into a [`SnapshotSlot`] and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    taken_at: Option<Timestamp>,
    records: Vec<MetricRecord>,
}

impl MetricSnapshot {
    pub fn new(taken_at: Timestamp, records: Vec<MetricRecord>) -> Self {
        Self {
            taken_at: Some(taken_at),
            records,
        }
    }

    /// The snapshot a collector starts with, before any scrape succeeded.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn taken_at(&self) -> Option<Timestamp> {
        self.taken_at
    }

    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Value of the record with this series name and exact label values.
    pub fn value(&self, name: &str, labels: &[&str]) -> Option<f64> {
        self.records
            .iter()
            .find(|record| record.matches(name, labels))
            .map(|record| record.value)
    }

    /// Number of records belonging to the named series.
    pub fn series_len(&self, name: &str) -> usize {
        self.records.iter().filter(|record| record.series.name == name).count()
    }

    /// Group records into one metric family per series, in `series` order.
    /// Series without records are left out.
    pub fn to_families(&self, series: &[SeriesDef]) -> Vec<MetricFamily> {
        series
            .iter()
            .filter_map(|def| {
                let mut family = def.empty_family();
                for record in self.records.iter().filter(|record| record.series.name == def.name) {
                    family.mut_metric().push(record.to_proto());
                }
                (!family.get_metric().is_empty()).then_some(family)
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 3.5 Snapshot Slot - Arena of One
// ----------------------------------------------------------------------------

/// Shared cell holding a collector's current snapshot.
///
/// The lock is held only to clone or replace the `Arc`; building and encoding
/// snapshots always happens outside it.
#[derive(Debug)]
pub struct SnapshotSlot {
    current: Mutex<Arc<MetricSnapshot>>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Arc::new(MetricSnapshot::empty())),
        }
    }

    /// Current snapshot. Cheap: one lock plus a refcount increment.
    pub fn load(&self) -> Arc<MetricSnapshot> {
        Arc::clone(&self.current.lock())
    }

    /// Replace the current snapshot and hand back the previous one.
    pub fn publish(&self, snapshot: MetricSnapshot) -> Arc<MetricSnapshot> {
        let next = Arc::new(snapshot);
        let mut guard = self.current.lock();
        mem::replace(&mut *guard, next)
    }
}

impl Default for SnapshotSlot {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Configuration and admin API failures get their own types; everything the
// process entry point can hit converges on `ExporterError`.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Admin API error: {0}")]
    Admin(#[from] AdminApiError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Admin(e) => e.category(),
            ExporterError::Metrics(_) => "metrics",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Admin API Errors
// ----------------------------------------------------------------------------

/// Failures talking to the RGW admin API.
///
/// A collector treats every variant the same way: the cycle is abandoned and
/// the previous snapshot stays published.
#[derive(Error, Debug)]
pub enum AdminApiError {
    #[error("failed to construct admin URL for '{path}': {message}")]
    InvalidUrl { path: String, message: String },

    #[error("failed to sign request: {message}")]
    Signing { message: String },

    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned {status} - Body: {body}")]
    Status { endpoint: String, status: u16, body: String },

    #[error("failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("quota lookup for user '{uid}' failed: {source}")]
    UserQuota {
        uid: String,
        #[source]
        source: Box<AdminApiError>,
    },
}

impl AdminApiError {
    pub fn category(&self) -> &'static str {
        match self {
            AdminApiError::InvalidUrl { .. } => "url",
            AdminApiError::Signing { .. } => "signing",
            AdminApiError::Transport { .. } => "transport",
            AdminApiError::Status { .. } => "status",
            AdminApiError::Decode { .. } => "decode",
            AdminApiError::UserQuota { .. } => "user_quota",
        }
    }

    pub fn status(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        AdminApiError::Status {
            endpoint: endpoint.into(),
            status,
            body: body.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Result type for admin API operations
pub type AdminResult<T> = Result<T, AdminApiError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Defaults, then an optional TOML file, then RGW_EXPORTER_* environment
// variables. The result is validated once and fixed for the process lifetime.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Secrets
// ----------------------------------------------------------------------------

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"<redacted>\"")
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Exporter Configuration
// ----------------------------------------------------------------------------

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Root configuration for the exporter.
///
/// Every key maps directly onto an `RGW_EXPORTER_<KEY>` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ExporterConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log output format
    pub log_format: LogFormat,

    /// Port the HTTP server listens on
    #[validate(range(min = 1))]
    pub port: u16,

    /// Base URL of the RADOS Gateway
    #[validate(custom = "validate_rgw_url")]
    pub rgw_url: String,

    /// Scrape interval shared by every collector
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_interval")]
    pub interval: Duration,

    /// S3 access key of an admin-capable RGW user
    #[validate(length(min = 1, message = "access_key is required"))]
    pub access_key: String,

    /// S3 secret key of an admin-capable RGW user
    #[validate(custom = "validate_secret")]
    pub secret_key: Secret,

    /// SigV4 signing region
    #[validate(length(min = 1, message = "region must not be empty"))]
    pub region: String,

    /// Upper bound on a single admin API request
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_interval")]
    pub request_timeout: Duration,

    /// How long shutdown waits for in-flight requests and scrapes
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::default(),
            port: DEFAULT_HTTP_PORT,
            rgw_url: String::new(),
            interval: Duration::from_secs(DEFAULT_SCRAPE_INTERVAL_SECS),
            access_key: String::new(),
            secret_key: Secret::default(),
            region: DEFAULT_REGION.into(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl ExporterConfig {
    /// Load configuration: defaults, optional TOML file, environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ExporterConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Extract and validate from a prepared figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Run field validation and flatten the report into a `ConfigError`.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        self.validate().map_err(|e| ConfigError::ValidationFailed {
            message: e.to_string(),
        })
    }

    /// Render the defaults as a TOML document.
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Parsed log level. Validation guarantees this succeeds for loaded configs.
    pub fn level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|e| ConfigError::invalid_value("log_level", e.to_string()))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    level
        .parse::<Level>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("log_level must be one of trace, debug, info, warn, error"))
}

fn validate_rgw_url(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("rgw_url is required"));
    }
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        _ => Err(ValidationError::new("rgw_url must be an absolute http(s) URL")),
    }
}

fn validate_interval(interval: &Duration) -> Result<(), ValidationError> {
    if interval.is_zero() {
        return Err(ValidationError::new("duration must be positive"));
    }
    Ok(())
}

fn validate_secret(secret: &Secret) -> Result<(), ValidationError> {
    if secret.is_empty() {
        return Err(ValidationError::new("secret_key is required"));
    }
    Ok(())
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Install the global tracing subscriber.
///
/// `level` is the default directive; `RUST_LOG` directives still win.
pub fn init_logging(level: Level, format: LogFormat) -> ExporterResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
    };
    installed.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "radosgw_exporter::init",
        level = %level,
        format = %format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: ADMIN API PAYLOADS
// ============================================================================
// Shapes of the JSON documents the RGW admin API returns. Missing fields
// decode to their defaults rather than failing the whole cycle.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Usage (GET /admin/usage)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageResponse {
    pub entries: Vec<UsageEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageEntry {
    pub user: String,
    pub buckets: Vec<BucketUsageEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketUsageEntry {
    pub bucket: String,
    pub owner: String,
    pub categories: Vec<UsageCategoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCategoryEntry {
    pub category: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub ops: u64,
    pub successful_ops: u64,
}

/// One (owner, bucket, category) row of a usage payload.
///
/// The owner is the user of the enclosing usage entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawUsageEntry<'a> {
    pub owner: &'a str,
    pub bucket: &'a str,
    pub counters: &'a UsageCategoryEntry,
}

impl<'a> RawUsageEntry<'a> {
    pub fn key(&self) -> UsageKey {
        UsageKey {
            owner: CompactString::from(self.owner),
            bucket: CompactString::from(self.bucket),
            category: CompactString::from(self.counters.category.as_str()),
        }
    }
}

impl UsageResponse {
    /// Flatten user → bucket → category nesting into raw rows.
    pub fn raw_entries(&self) -> impl Iterator<Item = RawUsageEntry<'_>> + '_ {
        self.entries.iter().flat_map(|entry| {
            entry.buckets.iter().flat_map(move |bucket| {
                bucket.categories.iter().map(move |counters| RawUsageEntry {
                    owner: entry.user.as_str(),
                    bucket: bucket.bucket.as_str(),
                    counters,
                })
            })
        })
    }
}

// ----------------------------------------------------------------------------
// 7.2 Buckets (GET /admin/bucket?stats=True)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketInfo {
    #[serde(rename = "bucket")]
    pub name: String,
    pub owner: String,
    pub zonegroup: String,
    pub num_shards: u64,
    pub usage: HashMap<String, BucketUsage>,
    #[serde(rename = "bucket_quota")]
    pub quota: QuotaInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketUsage {
    pub size_actual: u64,
    pub size_utilized: u64,
    pub num_objects: u64,
}

/// Quota settings, shared by buckets and users. RGW reports `-1` for
/// unlimited, so limits stay signed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaInfo {
    pub enabled: bool,
    pub max_size: i64,
    pub max_objects: i64,
}

// ----------------------------------------------------------------------------
// 7.3 Users (GET /admin/user?list, GET /admin/user?quota)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserListResponse {
    pub keys: Vec<String>,
}

// ============================================================================
// SECTION 8: AWS SIGNATURE V4
// ============================================================================
// The admin API authenticates with the same header-based SigV4 scheme as S3.
// Only GET requests without a body are issued, so the payload hash is always
// the hash of the empty string.
// ============================================================================

pub const SIGV4_ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SIGV4_SERVICE_S3: &str = "s3";

const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const SCOPE_DATE_FORMAT: &str = "%Y%m%d";

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
const RFC3986_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], data: &[u8]) -> AdminResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| AdminApiError::Signing {
        message: e.to_string(),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Headers a signed request must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub amz_date: String,
    pub content_sha256: String,
    pub authorization: String,
}

/// Static-credential SigV4 signer.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: Secret,
    region: String,
    service: &'static str,
}

impl SigV4Signer {
    pub fn new(access_key: impl Into<String>, secret_key: Secret, region: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key,
            region: region.into(),
            service: SIGV4_SERVICE_S3,
        }
    }

    pub fn with_service(mut self, service: &'static str) -> Self {
        self.service = service;
        self
    }

    /// Sign a body-less request to `url` at time `now`.
    pub fn sign(&self, method: &str, url: &Url, now: DateTime<Utc>) -> AdminResult<SignedHeaders> {
        let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
        let content_sha256 = hex_sha256(b"");
        let headers = [
            ("host", host_header(url)),
            ("x-amz-content-sha256", content_sha256.clone()),
            ("x-amz-date", amz_date.clone()),
        ];
        let authorization = self.authorization(method, url, &headers, &content_sha256, now)?;

        Ok(SignedHeaders {
            amz_date,
            content_sha256,
            authorization,
        })
    }

    /// Compute the `Authorization` header value over an explicit header set.
    pub fn authorization(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> AdminResult<String> {
        let (canonical, signed_headers) = canonical_request(method, url, headers, payload_hash);
        let scope = self.scope(now);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            SIGV4_ALGORITHM,
            now.format(AMZ_DATE_FORMAT),
            scope,
            hex_sha256(canonical.as_bytes())
        );
        let key = self.signing_key(now)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            SIGV4_ALGORITHM, self.access_key, scope, signed_headers, signature
        ))
    }

    /// Derive the per-day signing key.
    pub fn signing_key(&self, now: DateTime<Utc>) -> AdminResult<[u8; 32]> {
        let secret = format!("AWS4{}", self.secret_key.expose());
        let date = hmac_sha256(secret.as_bytes(), now.format(SCOPE_DATE_FORMAT).to_string().as_bytes())?;
        let region = hmac_sha256(&date, self.region.as_bytes())?;
        let service = hmac_sha256(&region, self.service.as_bytes())?;
        hmac_sha256(&service, b"aws4_request")
    }

    fn scope(&self, now: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            now.format(SCOPE_DATE_FORMAT),
            self.region,
            self.service
        )
    }
}

/// `host[:port]`, with the port left out when it is the scheme default.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| {
            let decoded = percent_decode_str(segment).decode_utf8_lossy();
            utf8_percent_encode(&decoded, RFC3986_ESCAPE).to_string()
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            (
                utf8_percent_encode(&key, RFC3986_ESCAPE).to_string(),
                utf8_percent_encode(&value, RFC3986_ESCAPE).to_string(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonical request text plus the `;`-joined signed header names.
fn canonical_request(
    method: &str,
    url: &Url,
    headers: &[(&str, String)],
    payload_hash: &str,
) -> (String, String) {
    let mut normalized: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_ascii_lowercase(),
                value.split_whitespace().collect::<Vec<_>>().join(" "),
            )
        })
        .collect();
    normalized.sort();

    let canonical_headers: String = normalized
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = normalized
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical = [
        method.to_string(),
        canonical_uri(url),
        canonical_query(url),
        canonical_headers,
        signed_headers.clone(),
        payload_hash.to_string(),
    ]
    .join("\n");

    (canonical, signed_headers)
}

// ============================================================================
// SECTION 9: ADMIN API CLIENT
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Fetcher Capability
// ----------------------------------------------------------------------------

/// Raw statistics source. One call per admin endpoint; fan-out across users
/// is left to the caller so it can decide how to handle partial failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Per-user, per-bucket, per-category operation usage.
    async fn usage(&self) -> AdminResult<UsageResponse>;

    /// Every bucket including storage usage.
    async fn buckets(&self) -> AdminResult<Vec<BucketInfo>>;

    /// All user ids.
    async fn list_users(&self) -> AdminResult<Vec<String>>;

    /// User-scoped quota of one user.
    async fn user_quota(&self, uid: &str) -> AdminResult<QuotaInfo>;
}

/// Readiness check against the gateway, independent of collector state.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> AdminResult<()>;
}

// ----------------------------------------------------------------------------
// 9.2 RGW HTTP Client
// ----------------------------------------------------------------------------

/// reqwest-backed admin API client signing every request with SigV4.
#[derive(Debug, Clone)]
pub struct RgwAdminClient {
    http: HttpClient,
    base_url: Url,
    signer: Arc<SigV4Signer>,
}

impl RgwAdminClient {
    /// Build a client from the exporter configuration. Redirects are never
    /// followed; a 3xx surfaces as a status error.
    pub fn new(config: &ExporterConfig) -> AdminResult<Self> {
        let base_url = Url::parse(&config.rgw_url).map_err(|e| AdminApiError::InvalidUrl {
            path: config.rgw_url.clone(),
            message: e.to_string(),
        })?;

        let http = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .tcp_keepalive(Duration::from_secs(TCP_KEEPALIVE_SECS))
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| AdminApiError::Transport {
                endpoint: config.rgw_url.clone(),
                source,
            })?;

        let signer = SigV4Signer::new(config.access_key.clone(), config.secret_key.clone(), config.region.clone());

        Ok(Self::with_http_client(http, base_url, signer))
    }

    pub fn with_http_client(http: HttpClient, base_url: Url, signer: SigV4Signer) -> Self {
        Self {
            http,
            base_url,
            signer: Arc::new(signer),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` against the base URL and attach the query pairs.
    ///
    /// The wire query is the canonical SigV4 form, so a space travels as
    /// `%20` exactly as it was signed, never as a form-encoded `+`.
    pub fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> AdminResult<Url> {
        let mut url = self.base_url.join(path).map_err(|e| AdminApiError::InvalidUrl {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        if !query.is_empty() {
            {
                let mut pairs = url.query_pairs_mut();
                pairs.clear();
                for (key, value) in query {
                    pairs.append_pair(key, value);
                }
            }
            let canonical = canonical_query(&url);
            url.set_query(Some(&canonical));
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> AdminResult<T> {
        let url = self.endpoint(path, query)?;
        let endpoint = url.path().to_string();
        let signed = self.signer.sign("GET", &url, Utc::now())?;

        trace!(target: "radosgw_exporter::client", endpoint = %endpoint, "Querying admin API");

        let response = self
            .http
            .get(url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header(reqwest::header::AUTHORIZATION, signed.authorization)
            .send()
            .await
            .map_err(|source| AdminApiError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|source| AdminApiError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;

        if status != reqwest::StatusCode::OK {
            return Err(AdminApiError::status(
                endpoint,
                status.as_u16(),
                String::from_utf8_lossy(&body),
            ));
        }

        serde_json::from_slice(&body).map_err(|source| AdminApiError::Decode { endpoint, source })
    }
}

#[async_trait]
impl AdminApi for RgwAdminClient {
    async fn usage(&self) -> AdminResult<UsageResponse> {
        self.get_json(
            USAGE_PATH,
            &[("format", "json"), ("show-entries", "True"), ("show-summary", "False")],
        )
        .await
    }

    async fn buckets(&self) -> AdminResult<Vec<BucketInfo>> {
        self.get_json(BUCKET_PATH, &[("format", "json"), ("stats", "True")]).await
    }

    async fn list_users(&self) -> AdminResult<Vec<String>> {
        let list: UserListResponse = self.get_json(USER_PATH, &[("format", "json"), ("list", "")]).await?;
        Ok(list.keys)
    }

    async fn user_quota(&self, uid: &str) -> AdminResult<QuotaInfo> {
        self.get_json(
            USER_PATH,
            &[("format", "json"), ("quota", ""), ("uid", uid), ("quota-type", "user")],
        )
        .await
    }
}

#[async_trait]
impl ReadinessProbe for RgwAdminClient {
    /// Unsigned GET of the gateway's swift health check.
    async fn check(&self) -> AdminResult<()> {
        let url = self.endpoint(HEALTHCHECK_PATH, &[])?;
        let endpoint = url.path().to_string();

        let response = self.http.get(url).send().await.map_err(|source| AdminApiError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;
        let status = response.status();
        response.bytes().await.map_err(|source| AdminApiError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;

        if status != reqwest::StatusCode::OK {
            return Err(AdminApiError::status(endpoint, status.as_u16(), ""));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION 10: AGGREGATION
// ============================================================================
// Pure transforms from raw admin payloads to metric records. Nothing here
// touches the network or shared state.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Series Catalogue
// ----------------------------------------------------------------------------

const USAGE_LABELS: &[&str] = &["bucket", "owner", "category"];
const BUCKET_LABELS: &[&str] = &["bucket", "owner", "zonegroup"];
const USER_LABELS: &[&str] = &["user"];

pub static USAGE_SERIES: [SeriesDef; 4] = [
    SeriesDef {
        name: "radosgw_usage_ops_total",
        help: "Number of operations",
        kind: SeriesKind::Counter,
        labels: USAGE_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_successful_ops_total",
        help: "Number of successful operations",
        kind: SeriesKind::Counter,
        labels: USAGE_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_sent_bytes_total",
        help: "Bytes sent by RGW",
        kind: SeriesKind::Counter,
        labels: USAGE_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_received_bytes_total",
        help: "Bytes received by RGW",
        kind: SeriesKind::Counter,
        labels: USAGE_LABELS,
    },
];

pub static BUCKET_SERIES: [SeriesDef; 7] = [
    SeriesDef {
        name: "radosgw_usage_bucket_bytes",
        help: "Bucket used bytes",
        kind: SeriesKind::Gauge,
        labels: BUCKET_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_bucket_utilized_bytes",
        help: "Bucket utilized bytes",
        kind: SeriesKind::Gauge,
        labels: BUCKET_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_bucket_objects",
        help: "Number of objects in the bucket",
        kind: SeriesKind::Gauge,
        labels: BUCKET_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_bucket_shards",
        help: "Number of index shards for the bucket",
        kind: SeriesKind::Gauge,
        labels: BUCKET_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_bucket_quota_enabled",
        help: "Whether a quota is enabled for the bucket",
        kind: SeriesKind::Gauge,
        labels: BUCKET_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_bucket_quota_size_bytes",
        help: "Maximum allowed size of the bucket",
        kind: SeriesKind::Gauge,
        labels: BUCKET_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_bucket_quota_size_objects",
        help: "Maximum allowed number of objects in the bucket",
        kind: SeriesKind::Gauge,
        labels: BUCKET_LABELS,
    },
];

pub static USER_SERIES: [SeriesDef; 3] = [
    SeriesDef {
        name: "radosgw_usage_user_quota_enabled",
        help: "Whether a quota is enabled for the user",
        kind: SeriesKind::Gauge,
        labels: USER_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_user_quota_size_bytes",
        help: "Maximum allowed size for the user",
        kind: SeriesKind::Gauge,
        labels: USER_LABELS,
    },
    SeriesDef {
        name: "radosgw_usage_user_quota_size_objects",
        help: "Maximum allowed number of objects for the user",
        kind: SeriesKind::Gauge,
        labels: USER_LABELS,
    },
];

static OPS_TOTAL: &SeriesDef = &USAGE_SERIES[0];
static SUCCESSFUL_OPS_TOTAL: &SeriesDef = &USAGE_SERIES[1];
static SENT_BYTES_TOTAL: &SeriesDef = &USAGE_SERIES[2];
static RECEIVED_BYTES_TOTAL: &SeriesDef = &USAGE_SERIES[3];

static BUCKET_BYTES: &SeriesDef = &BUCKET_SERIES[0];
static BUCKET_UTILIZED_BYTES: &SeriesDef = &BUCKET_SERIES[1];
static BUCKET_OBJECTS: &SeriesDef = &BUCKET_SERIES[2];
static BUCKET_SHARDS: &SeriesDef = &BUCKET_SERIES[3];
static BUCKET_QUOTA_ENABLED: &SeriesDef = &BUCKET_SERIES[4];
static BUCKET_QUOTA_SIZE_BYTES: &SeriesDef = &BUCKET_SERIES[5];
static BUCKET_QUOTA_SIZE_OBJECTS: &SeriesDef = &BUCKET_SERIES[6];

static USER_QUOTA_ENABLED: &SeriesDef = &USER_SERIES[0];
static USER_QUOTA_SIZE_BYTES: &SeriesDef = &USER_SERIES[1];
static USER_QUOTA_SIZE_OBJECTS: &SeriesDef = &USER_SERIES[2];

#[inline]
fn flag(enabled: bool) -> f64 {
    if enabled {
        1.0
    } else {
        0.0
    }
}

// ----------------------------------------------------------------------------
// 10.2 Usage Aggregation
// ----------------------------------------------------------------------------

/// Identity of an aggregated usage series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub owner: CompactString,
    pub bucket: CompactString,
    pub category: CompactString,
}

/// Summed counters of every raw row sharing a [`UsageKey`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageAggregate {
    pub ops: u64,
    pub successful_ops: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl UsageAggregate {
    fn absorb(&mut self, counters: &UsageCategoryEntry) {
        self.ops = self.ops.saturating_add(counters.ops);
        self.successful_ops = self.successful_ops.saturating_add(counters.successful_ops);
        self.bytes_sent = self.bytes_sent.saturating_add(counters.bytes_sent);
        self.bytes_received = self.bytes_received.saturating_add(counters.bytes_received);
    }
}

/// Fold raw rows into one aggregate per key.
///
/// RGW sometimes returns several rows for the same key with different
/// counts; they must be summed before being exposed as counters.
pub fn aggregate_usage<'a, I>(entries: I) -> AHashMap<UsageKey, UsageAggregate>
where
    I: IntoIterator<Item = RawUsageEntry<'a>>,
{
    let mut combined: AHashMap<UsageKey, UsageAggregate> = AHashMap::new();
    for entry in entries {
        combined.entry(entry.key()).or_default().absorb(entry.counters);
    }
    combined
}

/// Four counter records per aggregated key.
pub fn usage_records(aggregates: &AHashMap<UsageKey, UsageAggregate>, at: Timestamp) -> Vec<MetricRecord> {
    let mut records = Vec::with_capacity(aggregates.len() * USAGE_SERIES.len());
    for (key, value) in aggregates {
        let labels = [key.bucket.as_str(), key.owner.as_str(), key.category.as_str()];
        records.push(MetricRecord::new(OPS_TOTAL, &labels, value.ops as f64, at));
        records.push(MetricRecord::new(SUCCESSFUL_OPS_TOTAL, &labels, value.successful_ops as f64, at));
        records.push(MetricRecord::new(SENT_BYTES_TOTAL, &labels, value.bytes_sent as f64, at));
        records.push(MetricRecord::new(RECEIVED_BYTES_TOTAL, &labels, value.bytes_received as f64, at));
    }
    records
}

// ----------------------------------------------------------------------------
// 10.3 Bucket Aggregation
// ----------------------------------------------------------------------------

/// Shard, usage and quota records for every bucket.
///
/// Usage series appear only when the bucket reports the `rgw.main` category.
/// Quota limits are reported even when the quota is disabled.
pub fn bucket_records(buckets: &[BucketInfo], at: Timestamp) -> Vec<MetricRecord> {
    let mut records = Vec::with_capacity(buckets.len() * BUCKET_SERIES.len());
    for bucket in buckets {
        let labels = [bucket.name.as_str(), bucket.owner.as_str(), bucket.zonegroup.as_str()];

        records.push(MetricRecord::new(BUCKET_SHARDS, &labels, bucket.num_shards as f64, at));

        if let Some(usage) = bucket.usage.get(MAIN_USAGE_CATEGORY) {
            records.push(MetricRecord::new(BUCKET_BYTES, &labels, usage.size_actual as f64, at));
            records.push(MetricRecord::new(BUCKET_UTILIZED_BYTES, &labels, usage.size_utilized as f64, at));
            records.push(MetricRecord::new(BUCKET_OBJECTS, &labels, usage.num_objects as f64, at));
        }

        records.push(MetricRecord::new(BUCKET_QUOTA_ENABLED, &labels, flag(bucket.quota.enabled), at));
        records.push(MetricRecord::new(BUCKET_QUOTA_SIZE_BYTES, &labels, bucket.quota.max_size as f64, at));
        records.push(MetricRecord::new(BUCKET_QUOTA_SIZE_OBJECTS, &labels, bucket.quota.max_objects as f64, at));
    }
    records
}

// ----------------------------------------------------------------------------
// 10.4 User Quota Aggregation
// ----------------------------------------------------------------------------

pub fn user_quota_records(quotas: &BTreeMap<String, QuotaInfo>, at: Timestamp) -> Vec<MetricRecord> {
    let mut records = Vec::with_capacity(quotas.len() * USER_SERIES.len());
    for (user, quota) in quotas {
        let labels = [user.as_str()];
        records.push(MetricRecord::new(USER_QUOTA_ENABLED, &labels, flag(quota.enabled), at));
        records.push(MetricRecord::new(USER_QUOTA_SIZE_BYTES, &labels, quota.max_size as f64, at));
        records.push(MetricRecord::new(USER_QUOTA_SIZE_OBJECTS, &labels, quota.max_objects as f64, at));
    }
    records
}

// ============================================================================
// SECTION 11: SCRAPE ACCOUNTING
// ============================================================================
// Self-monitoring of the collectors. These live in the registry directly, as
// ordinary prometheus vectors, since they change outside of snapshot swaps.
// ============================================================================

/// Which admin resource a collector scrapes. Used as the `type` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScrapeKind {
    Ops,
    Buckets,
    Users,
}

impl ScrapeKind {
    pub const ALL: [ScrapeKind; 3] = [ScrapeKind::Ops, ScrapeKind::Buckets, ScrapeKind::Users];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeKind::Ops => "ops",
            ScrapeKind::Buckets => "buckets",
            ScrapeKind::Users => "users",
        }
    }
}

impl Display for ScrapeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scrape duration and outcome vectors shared by all collectors.
#[derive(Clone)]
pub struct ScrapeAccounting {
    duration_seconds: GaugeVec,
    count_total: IntCounterVec,
}

impl ScrapeAccounting {
    pub fn new() -> ExporterResult<Self> {
        let duration_seconds = GaugeVec::new(
            Opts::new("scrape_duration_seconds", "Amount of time each scrape takes").namespace(METRIC_NAMESPACE),
            &["type"],
        )?;
        let count_total = IntCounterVec::new(
            Opts::new("scrape_count_total", "Number of times a scrape has happened").namespace(METRIC_NAMESPACE),
            &["type", "status"],
        )?;

        Ok(Self {
            duration_seconds,
            count_total,
        })
    }

    pub fn register(&self, registry: &PrometheusRegistry) -> ExporterResult<()> {
        registry.register(Box::new(self.duration_seconds.clone()))?;
        registry.register(Box::new(self.count_total.clone()))?;
        Ok(())
    }

    /// Pre-resolved handles for one collector. Every (type, status) pair is
    /// exported at zero before the first scrape.
    pub fn recorder(&self, kind: ScrapeKind) -> ScrapeRecorder {
        ScrapeRecorder {
            duration: self.duration_seconds.with_label_values(&[kind.as_str()]),
            success: self.count_total.with_label_values(&[kind.as_str(), "success"]),
            error: self.count_total.with_label_values(&[kind.as_str(), "error"]),
        }
    }
}

impl Debug for ScrapeAccounting {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeAccounting").finish_non_exhaustive()
    }
}

/// Per-collector accounting handles.
#[derive(Clone)]
pub struct ScrapeRecorder {
    duration: Gauge,
    success: IntCounter,
    error: IntCounter,
}

impl ScrapeRecorder {
    pub fn record_success(&self, elapsed: Duration) {
        self.duration.set(elapsed.as_secs_f64());
        self.success.inc();
    }

    pub fn record_error(&self, elapsed: Duration) {
        self.duration.set(elapsed.as_secs_f64());
        self.error.inc();
    }

    pub fn successes(&self) -> u64 {
        self.success.get()
    }

    pub fn errors(&self) -> u64 {
        self.error.get()
    }

    pub fn last_duration(&self) -> f64 {
        self.duration.get()
    }
}

impl Debug for ScrapeRecorder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeRecorder")
            .field("successes", &self.successes())
            .field("errors", &self.errors())
            .field("last_duration", &self.last_duration())
            .finish()
    }
}

// ============================================================================
// SECTION 12: COLLECTOR FRAMEWORK
// ============================================================================
// One generic collector drives all three resources. A resource supplies the
// fetch step, the aggregation step and its series catalogue; the collector
// owns the loop, the snapshot slot and the accounting.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Resource Scraper Trait
// ----------------------------------------------------------------------------

/// Strategy for one admin resource.
#[async_trait]
pub trait ResourceScraper: Send + Sync + 'static {
    /// Raw payload produced by `fetch` and consumed by `aggregate`.
    type Raw: Send + 'static;

    fn kind(&self) -> ScrapeKind;

    /// Every series `aggregate` may emit.
    fn series(&self) -> &'static [SeriesDef];

    async fn fetch(&self, api: &dyn AdminApi) -> AdminResult<Self::Raw>;

    fn aggregate(&self, raw: Self::Raw, at: Timestamp) -> Vec<MetricRecord>;
}

// ----------------------------------------------------------------------------
// 12.2 Usage Resource
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageResource;

#[async_trait]
impl ResourceScraper for UsageResource {
    type Raw = UsageResponse;

    fn kind(&self) -> ScrapeKind {
        ScrapeKind::Ops
    }

    fn series(&self) -> &'static [SeriesDef] {
        &USAGE_SERIES
    }

    async fn fetch(&self, api: &dyn AdminApi) -> AdminResult<UsageResponse> {
        api.usage().await
    }

    fn aggregate(&self, raw: UsageResponse, at: Timestamp) -> Vec<MetricRecord> {
        usage_records(&aggregate_usage(raw.raw_entries()), at)
    }
}

// ----------------------------------------------------------------------------
// 12.3 Bucket Resource
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct BucketResource;

#[async_trait]
impl ResourceScraper for BucketResource {
    type Raw = Vec<BucketInfo>;

    fn kind(&self) -> ScrapeKind {
        ScrapeKind::Buckets
    }

    fn series(&self) -> &'static [SeriesDef] {
        &BUCKET_SERIES
    }

    async fn fetch(&self, api: &dyn AdminApi) -> AdminResult<Vec<BucketInfo>> {
        api.buckets().await
    }

    fn aggregate(&self, raw: Vec<BucketInfo>, at: Timestamp) -> Vec<MetricRecord> {
        bucket_records(&raw, at)
    }
}

// ----------------------------------------------------------------------------
// 12.4 User Quota Resource
// ----------------------------------------------------------------------------

/// Lists users, then looks up each user's quota one at a time.
///
/// The cycle is all-or-nothing: the first failed lookup aborts it, so a
/// published snapshot always covers every user that was listed.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserQuotaResource;

#[async_trait]
impl ResourceScraper for UserQuotaResource {
    type Raw = BTreeMap<String, QuotaInfo>;

    fn kind(&self) -> ScrapeKind {
        ScrapeKind::Users
    }

    fn series(&self) -> &'static [SeriesDef] {
        &USER_SERIES
    }

    async fn fetch(&self, api: &dyn AdminApi) -> AdminResult<BTreeMap<String, QuotaInfo>> {
        let users = api.list_users().await?;
        let mut quotas = BTreeMap::new();
        for uid in users {
            let quota = api.user_quota(&uid).await.map_err(|source| AdminApiError::UserQuota {
                uid: uid.clone(),
                source: Box::new(source),
            })?;
            quotas.insert(uid, quota);
        }
        Ok(quotas)
    }

    fn aggregate(&self, raw: BTreeMap<String, QuotaInfo>, at: Timestamp) -> Vec<MetricRecord> {
        user_quota_records(&raw, at)
    }
}

// ----------------------------------------------------------------------------
// 12.5 Scrape Collector
// ----------------------------------------------------------------------------

struct CollectorInner<R> {
    resource: R,
    api: Arc<dyn AdminApi>,
    slot: SnapshotSlot,
    recorder: ScrapeRecorder,
    descs: Vec<Desc>,
}

/// Periodic scraper plus registry collector for one resource.
///
/// Cheap to clone; clones share the snapshot slot and accounting handles.
pub struct ScrapeCollector<R: ResourceScraper> {
    inner: Arc<CollectorInner<R>>,
}

impl<R: ResourceScraper> Clone for ScrapeCollector<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ResourceScraper> Debug for ScrapeCollector<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeCollector")
            .field("kind", &self.kind())
            .field("records", &self.inner.slot.load().len())
            .field("recorder", &self.inner.recorder)
            .finish()
    }
}

impl<R: ResourceScraper> ScrapeCollector<R> {
    pub fn new(resource: R, api: Arc<dyn AdminApi>, accounting: &ScrapeAccounting) -> ExporterResult<Self> {
        let descs = resource
            .series()
            .iter()
            .map(SeriesDef::desc)
            .collect::<prometheus::Result<Vec<_>>>()?;
        let recorder = accounting.recorder(resource.kind());

        Ok(Self {
            inner: Arc::new(CollectorInner {
                resource,
                api,
                slot: SnapshotSlot::new(),
                recorder,
                descs,
            }),
        })
    }

    pub fn kind(&self) -> ScrapeKind {
        self.inner.resource.kind()
    }

    /// Snapshot currently served to readers.
    pub fn snapshot(&self) -> Arc<MetricSnapshot> {
        self.inner.slot.load()
    }

    pub fn recorder(&self) -> &ScrapeRecorder {
        &self.inner.recorder
    }

    /// Run one cycle: fetch, aggregate, publish.
    ///
    /// On a fetch error nothing is published and the error count goes up;
    /// readers keep seeing the previous snapshot. Returns the number of
    /// records published.
    pub async fn scrape_once(&self) -> AdminResult<usize> {
        let at = Timestamp::now();
        let started = Instant::now();
        let fetched = self.inner.resource.fetch(self.inner.api.as_ref()).await;
        let elapsed = started.elapsed();

        let raw = match fetched {
            Ok(raw) => {
                self.inner.recorder.record_success(elapsed);
                raw
            }
            Err(err) => {
                self.inner.recorder.record_error(elapsed);
                return Err(err);
            }
        };

        let records = self.inner.resource.aggregate(raw, at);
        let published = records.len();
        self.inner.slot.publish(MetricSnapshot::new(at, records));
        Ok(published)
    }

    /// Scrape immediately, then every `every`, until `shutdown` fires.
    ///
    /// Cycles run inline in the loop so they never overlap; ticks missed
    /// while a slow cycle runs are skipped rather than replayed.
    pub async fn run(self, every: Duration, shutdown: CancellationToken) {
        let kind = self.kind();
        let mut ticker = interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            target: "radosgw_exporter::collector",
            collector = %kind,
            interval = %humantime::format_duration(every),
            "Collector started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scrape_once().await {
                        Ok(records) => debug!(
                            target: "radosgw_exporter::collector",
                            collector = %kind,
                            records,
                            duration_secs = self.inner.recorder.last_duration(),
                            "Scrape cycle complete"
                        ),
                        Err(err) => error!(
                            target: "radosgw_exporter::collector",
                            collector = %kind,
                            category = err.category(),
                            error = %err,
                            duration_secs = self.inner.recorder.last_duration(),
                            "Failed to scrape RGW stats"
                        ),
                    }
                }
            }
        }

        info!(target: "radosgw_exporter::collector", collector = %kind, "Collector stopped");
    }
}

impl<R: ResourceScraper> PrometheusCollector for ScrapeCollector<R> {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.inner.slot.load();
        snapshot.to_families(self.inner.resource.series())
    }
}

// ============================================================================
// SECTION 13: METRICS EXPOSITION
// ============================================================================

/// Registry plus the `/metrics` handler's own instrumentation.
#[derive(Clone)]
pub struct Exposition {
    registry: PrometheusRegistry,
    requests_total: IntCounterVec,
    requests_in_flight: IntGauge,
}

impl Exposition {
    pub fn new(registry: PrometheusRegistry) -> ExporterResult<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "promhttp_metric_handler_requests_total",
                "Total number of scrapes by HTTP status code.",
            ),
            &["code"],
        )?;
        let requests_in_flight = IntGauge::new(
            "promhttp_metric_handler_requests_in_flight",
            "Current number of scrapes being served.",
        )?;
        for code in ["200", "500", "503"] {
            requests_total.with_label_values(&[code]);
        }
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_in_flight,
        })
    }

    pub fn registry(&self) -> &PrometheusRegistry {
        &self.registry
    }

    pub fn register<C: PrometheusCollector + 'static>(&self, collector: C) -> ExporterResult<()> {
        self.registry.register(Box::new(collector))?;
        Ok(())
    }

    /// Gather and encode the registry in the text exposition format.
    pub fn render(&self) -> ExporterResult<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::with_capacity(16 * 1024);
        encoder.encode(&families, &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    /// Serve one scrape, counting it by response code.
    pub fn handle_scrape(&self) -> Response {
        self.requests_in_flight.inc();
        let response = match self.render() {
            Ok((content_type, body)) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response(),
            Err(err) => {
                error!(target: "radosgw_exporter::server", error = %err, "Failed to encode metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics - {}", err)).into_response()
            }
        };
        self.requests_total
            .with_label_values(&[response.status().as_str()])
            .inc();
        self.requests_in_flight.dec();
        response
    }
}

impl Debug for Exposition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exposition")
            .field("in_flight", &self.requests_in_flight.get())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 14: HTTP SERVER
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub exposition: Arc<Exposition>,
    pub readiness: Arc<dyn ReadinessProbe>,
}

impl Debug for AppState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("exposition", &self.exposition)
            .finish_non_exhaustive()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/liveness", get(liveness_handler))
        .route("/readiness", get(readiness_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.exposition.handle_scrape()
}

async fn liveness_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "alive")
}

/// Ready means the gateway answers its health check right now.
async fn readiness_handler(State(state): State<AppState>) -> Response {
    match state.readiness.check().await {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(err) => {
            warn!(target: "radosgw_exporter::server", error = %err, "Readiness check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Ceph Health check failed - {}", err),
            )
                .into_response()
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

// ============================================================================
// SECTION 15: CLI & EXPORTER
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// RADOS Gateway usage exporter CLI
#[derive(Parser, Debug)]
#[command(
    name = "radosgw-exporter",
    version,
    about = "Prometheus exporter for Ceph RADOS Gateway usage statistics",
    long_about = "Periodically scrapes the RADOS Gateway admin API for operation usage, \
                  bucket statistics and user quotas, and serves them on /metrics."
)]
pub struct Cli {
    /// Optional TOML configuration file
    #[arg(short, long, env = "RGW_EXPORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the exporter (default)
    Run,

    /// Validate configuration
    Validate {
        /// Print the resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a default configuration file
    GenerateConfig {
        /// Output file path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 15.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: Option<&Path>, verbose: bool) -> ExporterResult<()> {
    match config_path {
        Some(path) => println!("Validating configuration: {} + {}* environment", path.display(), ENV_PREFIX),
        None => println!("Validating configuration from {}* environment", ENV_PREFIX),
    }

    match ExporterConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Resolved configuration:");
                println!("{}", "=".repeat(60));
                let mut shown = config.clone();
                shown.secret_key = Secret::new("<redacted>");
                match toml::to_string_pretty(&shown) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Gateway: {}", config.rgw_url);
            println!("  • Listen port: {}", config.port);
            println!("  • Scrape interval: {}", humantime::format_duration(config.interval));
            println!("  • Request timeout: {}", humantime::format_duration(config.request_timeout));
            println!("  • Signing region: {}", config.region);

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ExporterError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Collectors:");
    for kind in ScrapeKind::ALL {
        println!("  • {}", kind);
    }
}

// ----------------------------------------------------------------------------
// 15.3 Exporter
// ----------------------------------------------------------------------------

/// Wires collectors, the registry and the HTTP server together.
pub struct Exporter {
    config: ExporterConfig,
    exposition: Arc<Exposition>,
    readiness: Arc<dyn ReadinessProbe>,
    usage: ScrapeCollector<UsageResource>,
    buckets: ScrapeCollector<BucketResource>,
    users: ScrapeCollector<UserQuotaResource>,
}

impl Debug for Exporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("config", &self.config)
            .field("usage", &self.usage)
            .field("buckets", &self.buckets)
            .field("users", &self.users)
            .finish_non_exhaustive()
    }
}

impl Exporter {
    /// Build an exporter talking to the configured gateway.
    pub fn new(config: ExporterConfig) -> ExporterResult<Self> {
        let client = Arc::new(RgwAdminClient::new(&config)?);
        Self::with_api(config, client.clone(), client)
    }

    /// Build an exporter over an arbitrary admin API and readiness probe.
    pub fn with_api(
        config: ExporterConfig,
        api: Arc<dyn AdminApi>,
        readiness: Arc<dyn ReadinessProbe>,
    ) -> ExporterResult<Self> {
        let registry = PrometheusRegistry::new();
        let accounting = ScrapeAccounting::new()?;
        accounting.register(&registry)?;

        let usage = ScrapeCollector::new(UsageResource, Arc::clone(&api), &accounting)?;
        let buckets = ScrapeCollector::new(BucketResource, Arc::clone(&api), &accounting)?;
        let users = ScrapeCollector::new(UserQuotaResource, api, &accounting)?;

        let exposition = Exposition::new(registry)?;
        exposition.register(usage.clone())?;
        exposition.register(buckets.clone())?;
        exposition.register(users.clone())?;

        Ok(Self {
            config,
            exposition: Arc::new(exposition),
            readiness,
            usage,
            buckets,
            users,
        })
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn exposition(&self) -> Arc<Exposition> {
        Arc::clone(&self.exposition)
    }

    pub fn router(&self) -> Router {
        build_router(AppState {
            exposition: self.exposition(),
            readiness: Arc::clone(&self.readiness),
        })
    }

    /// Spawn one scrape loop per collector.
    pub fn start_collectors(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let every = self.config.interval;
        vec![
            tokio::spawn(self.usage.clone().run(every, shutdown.clone())),
            tokio::spawn(self.buckets.clone().run(every, shutdown.clone())),
            tokio::spawn(self.users.clone().run(every, shutdown.clone())),
        ]
    }

    /// Serve until `shutdown` fires, then drain within the shutdown timeout.
    pub async fn run(self, shutdown: CancellationToken) -> ExporterResult<()> {
        info!(
            target: "radosgw_exporter::exporter",
            version = EXPORTER_VERSION,
            rgw_url = %self.config.rgw_url,
            interval = %humantime::format_duration(self.config.interval),
            "Starting {}",
            EXPORTER_FULL_NAME
        );

        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr).await?;
        info!(target: "radosgw_exporter::server", %addr, "HTTP server listening");

        let collectors = self.start_collectors(&shutdown);

        let server_token = shutdown.clone();
        let router = self.router();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await
        });

        let mut outcome = Ok(());
        tokio::select! {
            _ = shutdown.cancelled() => {}
            exited = &mut server => {
                // The server only returns on its own when it failed.
                shutdown.cancel();
                outcome = match exited {
                    Ok(Ok(())) => Err(ExporterError::Internal("HTTP server exited unexpectedly".into())),
                    Ok(Err(e)) => Err(ExporterError::Io(e)),
                    Err(e) => Err(ExporterError::Internal(format!("HTTP server task failed: {}", e))),
                };
            }
        }

        let grace = self.config.shutdown_timeout;
        info!(
            target: "radosgw_exporter::exporter",
            timeout = %humantime::format_duration(grace),
            "Shutting down, waiting for in-progress requests"
        );
        let shutdown_start = Instant::now();

        if outcome.is_ok() {
            match timeout(grace, &mut server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!(target: "radosgw_exporter::server", error = %e, "HTTP server error during shutdown"),
                Ok(Err(e)) => error!(target: "radosgw_exporter::server", error = %e, "HTTP server task failed"),
                Err(_) => {
                    warn!(target: "radosgw_exporter::server", "Shutdown timeout elapsed, dropping open connections");
                    server.abort();
                }
            }
        }

        if timeout(grace, join_all(collectors)).await.is_err() {
            warn!(target: "radosgw_exporter::collector", "Collectors did not stop within the shutdown timeout");
        }

        info!(
            target: "radosgw_exporter::exporter",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Shutdown complete"
        );

        outcome
    }
}

// ============================================================================
// SECTION 16: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(cli.config.as_deref(), *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let mut config = ExporterConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    let level = config.level()?;
    init_logging(level, config.log_format)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => {
                info!(target: "radosgw_exporter::exporter", signal, "Shutdown signal received");
                signal_token.cancel();
            }
            Err(e) => error!(target: "radosgw_exporter::exporter", error = %e, "Failed to install signal handlers"),
        }
    });

    let exporter = Exporter::new(config).context("Failed to build exporter")?;
    exporter.run(shutdown).await?;

    Ok(())
}

// ============================================================================
// SECTION 17: TESTS
// ============================================================================


#[cfg(test)]
mod collector_tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn usage_fixture() -> UsageResponse {
        UsageResponse {
            entries: vec![UsageEntry {
                user: "alice".into(),
                buckets: vec![BucketUsageEntry {
                    bucket: "b1".into(),
                    owner: "alice".into(),
                    categories: vec![UsageCategoryEntry {
                        category: "put_obj".into(),
                        bytes_sent: 10,
                        bytes_received: 20,
                        ops: 2,
                        successful_ops: 2,
                    }],
                }],
            }],
        }
    }

    fn bucket(name: &str) -> BucketInfo {
        BucketInfo {
            name: name.into(),
            owner: "alice".into(),
            zonegroup: "zg".into(),
            num_shards: 1,
            usage: HashMap::from([(
                MAIN_USAGE_CATEGORY.to_string(),
                BucketUsage {
                    size_actual: 10,
                    size_utilized: 8,
                    num_objects: 2,
                },
            )]),
            quota: QuotaInfo::default(),
        }
    }

    fn unavailable(endpoint: &str) -> AdminApiError {
        AdminApiError::status(endpoint, 503, "SlowDown")
    }

    fn accounting() -> ScrapeAccounting {
        ScrapeAccounting::new().unwrap()
    }

    #[tokio::test]
    async fn test_successful_cycle_publishes_snapshot() {
        let mut api = MockAdminApi::new();
        api.expect_usage().times(1).returning(|| Ok(usage_fixture()));

        let collector = ScrapeCollector::new(UsageResource, Arc::new(api), &accounting()).unwrap();
        assert!(collector.snapshot().is_empty());

        let published = collector.scrape_once().await.unwrap();
        let snapshot = collector.snapshot();

        assert_eq!(published, 4);
        assert_eq!(snapshot.value("radosgw_usage_ops_total", &["b1", "alice", "put_obj"]), Some(2.0));
        assert_eq!(collector.recorder().successes(), 1);
        assert_eq!(collector.recorder().errors(), 0);
        assert!(collector.recorder().last_duration() >= 0.0);
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_previous_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut api = MockAdminApi::new();
        api.expect_buckets().times(2).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![bucket("b1")])
            } else {
                Err(unavailable("/admin/bucket"))
            }
        });

        let collector = ScrapeCollector::new(BucketResource, Arc::new(api), &accounting()).unwrap();
        collector.scrape_once().await.unwrap();
        let before = collector.snapshot();

        let err = collector.scrape_once().await.unwrap_err();
        assert!(matches!(err, AdminApiError::Status { status: 503, .. }));

        let after = collector.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.value("radosgw_usage_bucket_shards", &["b1", "alice", "zg"]), Some(1.0));
        assert_eq!(collector.recorder().successes(), 1);
        assert_eq!(collector.recorder().errors(), 1);
    }

    #[tokio::test]
    async fn test_failure_before_first_success_exposes_nothing() {
        let mut api = MockAdminApi::new();
        api.expect_usage().times(1).returning(|| Err(unavailable("/admin/usage")));

        let collector = ScrapeCollector::new(UsageResource, Arc::new(api), &accounting()).unwrap();
        assert!(collector.scrape_once().await.is_err());

        assert!(collector.snapshot().is_empty());
        assert!(collector.collect().is_empty());
        assert_eq!(collector.recorder().successes(), 0);
        assert_eq!(collector.recorder().errors(), 1);
    }

    #[tokio::test]
    async fn test_user_quota_failure_aborts_whole_cycle() {
        let cycle = Arc::new(AtomicUsize::new(0));
        let mut api = MockAdminApi::new();

        let listed = Arc::clone(&cycle);
        api.expect_list_users().times(2).returning(move || {
            listed.fetch_add(1, Ordering::SeqCst);
            Ok((1..=5).map(|i| format!("u{}", i)).collect())
        });

        let current = Arc::clone(&cycle);
        // Cycle one looks up all five users, cycle two stops at the third.
        api.expect_user_quota().times(8).returning(move |uid: &str| {
            if current.load(Ordering::SeqCst) == 2 && uid == "u3" {
                return Err(AdminApiError::status("/admin/user", 500, "InternalError"));
            }
            Ok(QuotaInfo {
                enabled: true,
                max_size: 100,
                max_objects: 10,
            })
        });

        let collector = ScrapeCollector::new(UserQuotaResource, Arc::new(api), &accounting()).unwrap();

        assert_eq!(collector.scrape_once().await.unwrap(), 15);
        let complete = collector.snapshot();

        match collector.scrape_once().await {
            Err(AdminApiError::UserQuota { uid, source }) => {
                assert_eq!(uid, "u3");
                assert!(matches!(*source, AdminApiError::Status { status: 500, .. }));
            }
            other => panic!("expected user quota failure, got {:?}", other),
        }

        let after = collector.snapshot();
        assert!(Arc::ptr_eq(&complete, &after));
        assert_eq!(after.series_len("radosgw_usage_user_quota_enabled"), 5);
        assert_eq!(collector.recorder().errors(), 1);
    }

    #[tokio::test]
    async fn test_collect_reflects_latest_snapshot() {
        let mut api = MockAdminApi::new();
        api.expect_buckets()
            .times(1)
            .returning(|| Ok(vec![bucket("b1"), bucket("b2")]));

        let collector = ScrapeCollector::new(BucketResource, Arc::new(api), &accounting()).unwrap();
        assert_eq!(collector.desc().len(), BUCKET_SERIES.len());
        assert!(collector.collect().is_empty());

        collector.scrape_once().await.unwrap();
        let families = collector.collect();

        assert_eq!(families.len(), BUCKET_SERIES.len());
        assert!(families.iter().all(|f| f.get_metric().len() == 2));
    }

    #[tokio::test]
    async fn test_registry_gathers_collectors_and_accounting() {
        let registry = PrometheusRegistry::new();
        let accounting = accounting();
        accounting.register(&registry).unwrap();

        let mut api = MockAdminApi::new();
        api.expect_usage().returning(|| Ok(usage_fixture()));
        let collector = ScrapeCollector::new(UsageResource, Arc::new(api), &accounting).unwrap();
        registry.register(Box::new(collector.clone())).unwrap();
        collector.scrape_once().await.unwrap();

        let names: Vec<String> = registry.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"radosgw_usage_ops_total".to_string()));
        assert!(names.contains(&"radosgw_usage_scrape_count_total".to_string()));
        assert!(names.contains(&"radosgw_usage_scrape_duration_seconds".to_string()));
    }

    #[tokio::test]
    async fn test_run_scrapes_immediately_and_stops_on_cancel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut api = MockAdminApi::new();
        api.expect_usage().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(usage_fixture())
        });

        let collector = ScrapeCollector::new(UsageResource, Arc::new(api), &accounting()).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(collector.clone().run(Duration::from_secs(3600), shutdown.clone()));

        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!collector.snapshot().is_empty());

        shutdown.cancel();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("collector loop should stop after cancellation")
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Admin API whose usage call takes a while and tracks concurrency.
    #[derive(Default)]
    struct SlowUsageApi {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AdminApi for SlowUsageApi {
        async fn usage(&self) -> AdminResult<UsageResponse> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(UsageResponse::default())
        }

        async fn buckets(&self) -> AdminResult<Vec<BucketInfo>> {
            Ok(Vec::new())
        }

        async fn list_users(&self) -> AdminResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn user_quota(&self, _uid: &str) -> AdminResult<QuotaInfo> {
            Ok(QuotaInfo::default())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_cycles_never_overlap() {
        let api = Arc::new(SlowUsageApi::default());
        let collector = ScrapeCollector::new(UsageResource, api.clone(), &accounting()).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(collector.run(Duration::from_millis(5), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        let calls = api.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected repeated cycles, got {}", calls);
        assert!(calls <= 9, "missed ticks should be skipped, got {} cycles", calls);
        assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    }

    /// Admin API whose answers carry the number of the cycle that fetched
    /// them, in every counter of every row.
    #[derive(Default)]
    struct GenerationApi {
        usage_cycles: AtomicU64,
        bucket_cycles: AtomicU64,
    }

    #[async_trait]
    impl AdminApi for GenerationApi {
        async fn usage(&self) -> AdminResult<UsageResponse> {
            let generation = self.usage_cycles.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;
            let categories = ["get_obj", "put_obj"]
                .iter()
                .map(|category| UsageCategoryEntry {
                    category: category.to_string(),
                    bytes_sent: generation,
                    bytes_received: generation,
                    ops: generation,
                    successful_ops: generation,
                })
                .collect();
            Ok(UsageResponse {
                entries: vec![UsageEntry {
                    user: "alice".into(),
                    buckets: vec![BucketUsageEntry {
                        bucket: "b1".into(),
                        owner: "alice".into(),
                        categories,
                    }],
                }],
            })
        }

        async fn buckets(&self) -> AdminResult<Vec<BucketInfo>> {
            let generation = self.bucket_cycles.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;
            Ok(["b1", "b2"]
                .iter()
                .map(|name| BucketInfo {
                    name: name.to_string(),
                    owner: "alice".into(),
                    zonegroup: "zg".into(),
                    num_shards: generation,
                    usage: HashMap::from([(
                        MAIN_USAGE_CATEGORY.to_string(),
                        BucketUsage {
                            size_actual: generation,
                            size_utilized: generation,
                            num_objects: generation,
                        },
                    )]),
                    quota: QuotaInfo {
                        enabled: false,
                        max_size: generation as i64,
                        max_objects: generation as i64,
                    },
                })
                .collect())
        }

        async fn list_users(&self) -> AdminResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn user_quota(&self, _uid: &str) -> AdminResult<QuotaInfo> {
            Ok(QuotaInfo::default())
        }
    }

    fn sample(family: &MetricFamily, metric: &proto::Metric) -> f64 {
        match family.get_field_type() {
            MetricType::COUNTER => metric.get_counter().get_value(),
            _ => metric.get_gauge().get_value(),
        }
    }

    /// Generation shared by every family of `series` in one gather, or `None`
    /// before the first publish. Panics on a partial or mixed snapshot.
    fn generation_of(families: &[MetricFamily], series: &[SeriesDef], rows: usize) -> Option<f64> {
        let mut generation = None;
        let mut present = 0;
        for family in families
            .iter()
            .filter(|family| series.iter().any(|def| def.name == family.get_name()))
        {
            present += 1;
            assert_eq!(family.get_metric().len(), rows, "rows of {}", family.get_name());
            if family.get_name() == BUCKET_QUOTA_ENABLED.name {
                continue;
            }
            for metric in family.get_metric() {
                let value = sample(family, metric);
                match generation {
                    None => generation = Some(value),
                    Some(seen) => assert_eq!(seen, value, "mixed generations in {}", family.get_name()),
                }
            }
        }
        assert!(
            present == 0 || present == series.len(),
            "partial snapshot: {} of {} families",
            present,
            series.len()
        );
        generation
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_collectors_publish_consistent_snapshots() {
        let api = Arc::new(GenerationApi::default());
        let accounting = accounting();
        let exposition = Exposition::new(PrometheusRegistry::new()).unwrap();
        accounting.register(exposition.registry()).unwrap();

        let usage = ScrapeCollector::new(UsageResource, api.clone(), &accounting).unwrap();
        let buckets = ScrapeCollector::new(BucketResource, api.clone(), &accounting).unwrap();
        exposition.register(usage.clone()).unwrap();
        exposition.register(buckets.clone()).unwrap();

        let shutdown = CancellationToken::new();
        let loops = vec![
            tokio::spawn(usage.clone().run(Duration::from_millis(1), shutdown.clone())),
            tokio::spawn(buckets.clone().run(Duration::from_millis(1), shutdown.clone())),
        ];

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let exposition = exposition.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let (mut last_usage, mut last_buckets, mut reads) = (0.0, 0.0, 0usize);
                    while !shutdown.is_cancelled() {
                        let families = exposition.registry().gather();
                        assert!(families
                            .iter()
                            .all(|family| USER_SERIES.iter().all(|def| def.name != family.get_name())));

                        if let Some(generation) = generation_of(&families, &USAGE_SERIES, 2) {
                            assert!(generation >= last_usage, "usage went from {} to {}", last_usage, generation);
                            last_usage = generation;
                        }
                        if let Some(generation) = generation_of(&families, &BUCKET_SERIES, 2) {
                            assert!(
                                generation >= last_buckets,
                                "buckets went from {} to {}",
                                last_buckets,
                                generation
                            );
                            last_buckets = generation;
                        }

                        exposition.render().unwrap();
                        reads += 1;
                        tokio::task::yield_now().await;
                    }
                    (last_usage, last_buckets, reads)
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();

        for handle in loops {
            timeout(Duration::from_secs(2), handle)
                .await
                .expect("collector loop should stop after cancellation")
                .unwrap();
        }
        for reader in readers {
            let (last_usage, last_buckets, reads) = timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
            assert!(reads > 0);
            assert!(last_usage >= 1.0, "reader never saw a usage snapshot");
            assert!(last_buckets >= 1.0, "reader never saw a bucket snapshot");
        }

        let usage_cycles = api.usage_cycles.load(Ordering::SeqCst);
        let bucket_cycles = api.bucket_cycles.load(Ordering::SeqCst);
        assert!(usage_cycles >= 2, "usage ran {} cycles", usage_cycles);
        assert!(bucket_cycles >= 2, "buckets ran {} cycles", bucket_cycles);

        assert_eq!(
            usage.snapshot().value("radosgw_usage_ops_total", &["b1", "alice", "put_obj"]),
            Some(usage_cycles as f64)
        );
        assert_eq!(
            buckets.snapshot().value("radosgw_usage_bucket_shards", &["b2", "alice", "zg"]),
            Some(bucket_cycles as f64)
        );
        assert_eq!(usage.recorder().successes(), usage_cycles);
        assert_eq!(buckets.recorder().errors(), 0);
    }
}


#[cfg(test)]
mod server_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct StaticProbe(bool);

    #[async_trait]
    impl ReadinessProbe for StaticProbe {
        async fn check(&self) -> AdminResult<()> {
            if self.0 {
                Ok(())
            } else {
                Err(AdminApiError::status("/swift/healthcheck", 503, ""))
            }
        }
    }

    fn exporter(ready: bool) -> Exporter {
        Exporter::with_api(
            ExporterConfig::default(),
            Arc::new(MockAdminApi::new()),
            Arc::new(StaticProbe(ready)),
        )
        .unwrap()
    }

    async fn fetch(router: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_liveness_is_always_ok() {
        let (status, _, body) = fetch(exporter(false).router(), "/liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "alive");
    }

    #[tokio::test]
    async fn test_readiness_follows_gateway_health() {
        let (status, _, body) = fetch(exporter(true).router(), "/readiness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");

        let (status, _, body) = fetch(exporter(false).router(), "/readiness").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Ceph Health check failed - "), "{}", body);
    }

    #[tokio::test]
    async fn test_metrics_before_first_scrape_shows_only_accounting() {
        let (status, content_type, body) = fetch(exporter(true).router(), "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert!(body.contains("# TYPE radosgw_usage_scrape_count_total counter"));
        assert!(body.contains("# TYPE radosgw_usage_scrape_duration_seconds gauge"));
        for kind in ScrapeKind::ALL {
            assert!(body.contains(&format!("type=\"{}\"", kind)), "missing {}", kind);
        }
        assert!(!body.contains("radosgw_usage_ops_total"));
        assert!(!body.contains("radosgw_usage_bucket_bytes"));
    }

    #[tokio::test]
    async fn test_metrics_handler_counts_its_requests() {
        let exporter = exporter(true);
        let router = exporter.router();

        fetch(router.clone(), "/metrics").await;
        let (_, _, body) = fetch(router, "/metrics").await;

        assert!(body.contains("promhttp_metric_handler_requests_total"));
        assert!(body.contains("promhttp_metric_handler_requests_in_flight"));
        let exposition = exporter.exposition();
        assert_eq!(exposition.requests_total.with_label_values(&["200"]).get(), 2);
        assert_eq!(exposition.requests_in_flight.get(), 0);
    }

    #[test]
    fn test_handler_status_codes_start_at_zero() {
        let exposition = Exposition::new(PrometheusRegistry::new()).unwrap();
        let (_, body) = exposition.render().unwrap();
        let text = String::from_utf8(body).unwrap();

        for code in ["200", "500", "503"] {
            let line = format!("promhttp_metric_handler_requests_total{{code=\"{}\"}} 0", code);
            assert!(text.contains(&line), "missing {} in\n{}", line, text);
        }
        assert!(text.contains("promhttp_metric_handler_requests_in_flight 0"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (status, _, _) = fetch(exporter(true).router(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ExporterConfig {
            port,
            interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(1),
            ..ExporterConfig::default()
        };
        let mut api = MockAdminApi::new();
        api.expect_usage().returning(|| Ok(UsageResponse::default()));
        api.expect_buckets().returning(|| Ok(Vec::new()));
        api.expect_list_users().returning(|| Ok(Vec::new()));
        let exporter = Exporter::with_api(config, Arc::new(api), Arc::new(StaticProbe(true))).unwrap();

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(exporter.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(result.is_ok(), "{:?}", result);
    }
}
