//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::PathBuf;
use std::time::Duration;

use crate::admission::AdmissionConfig;
use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MIB: u64 = 1024 * 1024;
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
pub const CREDENTIAL_HEADER: &str = "password";
pub const DEFAULT_MAX_FILE_SIZE_MIB: u64 = 1024;
pub const DEFAULT_MAX_STORAGE_SIZE_MIB: u64 = 10 * 1024;
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_MAX_QUEUING_SECS: u64 = 5;
pub const DEFAULT_RATE_LIMIT: f64 = 10.0;
pub const DEFAULT_RATE_BURST: u32 = 20;
pub const DEFAULT_ESTIMATE_INTERVAL_SECS: u64 = 5;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-ingest", version = VERSION_INFO, about = "AxoIngest upload server")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "AXO_ROOT_DIR",
        default_value = ".axo/storage",
        help = "Storage root for uploaded files"
    )]
    pub root_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_PORT",
        default_value_t = 5005,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "AXO_PASSWORD",
        help = "Shared secret expected in the `password` header of mutating requests"
    )]
    pub password: String,
    #[arg(long, env = "AXO_DOC_FILE", help = "Markdown document served at /")]
    pub doc_file: Option<String>,
    #[arg(
        long,
        env = "AXO_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE_MIB,
        help = "Max single file size in MiB"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "AXO_MAX_STORAGE_SIZE",
        default_value_t = DEFAULT_MAX_STORAGE_SIZE_MIB,
        help = "Max total storage size in MiB"
    )]
    pub max_storage_size: u64,
    #[arg(
        long,
        env = "AXO_MAX_CONCURRENCY",
        default_value_t = DEFAULT_MAX_CONCURRENCY,
        help = "Max simultaneously in-flight requests"
    )]
    pub max_concurrency: usize,
    #[arg(
        long,
        env = "AXO_MAX_QUEUING",
        default_value_t = DEFAULT_MAX_QUEUING_SECS,
        help = "Max seconds a request waits for a concurrency slot"
    )]
    pub max_queuing: u64,
    #[arg(
        long,
        env = "AXO_RATE_LIMIT",
        default_value_t = DEFAULT_RATE_LIMIT,
        help = "Sustained request rate in events per second"
    )]
    pub rate_limit: f64,
    #[arg(
        long,
        env = "AXO_RATE_BURST",
        default_value_t = DEFAULT_RATE_BURST,
        help = "Request burst size"
    )]
    pub rate_burst: u32,
    #[arg(
        long,
        env = "AXO_ESTIMATE_INTERVAL_SECS",
        default_value_t = DEFAULT_ESTIMATE_INTERVAL_SECS,
        help = "Storage usage refresh interval in seconds"
    )]
    pub estimate_interval_secs: u64,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_LOG_LEVEL",
        default_value = "info",
        help = "Log filter used when RUST_LOG is unset"
    )]
    pub log_level: String,
}

impl Args {
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root_dir)
    }

    pub fn estimate_interval(&self) -> Duration {
        Duration::from_secs(self.estimate_interval_secs.max(1))
    }

    /// Admission limits in bytes and durations, as consumed by the gate.
    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            credential: self.password.clone(),
            rate_per_sec: self.rate_limit,
            burst: self.rate_burst,
            max_concurrency: self.max_concurrency,
            max_queue_wait: Duration::from_secs(self.max_queuing),
            max_file_size: self.max_file_size.saturating_mul(MIB),
            max_storage_size: self.max_storage_size.saturating_mul(MIB),
        }
    }
}
