//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;
use crate::store::StoreConfig;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const UPLOAD_PATH: &str = "/api/upload";
pub const DEFAULT_HTTP_PORT: u16 = 3000;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_SECS: u64 = 30;
pub const DEFAULT_CHUNK_IDLE_SECS: u64 = 60;
pub const UPLOAD_EXPIRE_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "tusdrop", version = VERSION_INFO, about = "Resumable upload file server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "UPLOAD_DIR",
        default_value = "./uploads",
        help = "Storage directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "UPLOAD_PASSWORD",
        hide_env_values = true,
        help = "Shared secret required by the upload endpoints"
    )]
    pub upload_password: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "HTTPS_PORT",
        help = "HTTPS port (HTTPS is disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max declared upload length in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "UPLOAD_LOCK_WAIT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_SECS,
        help = "Seconds a request waits for a busy upload before giving up"
    )]
    pub lock_wait_secs: u64,
    #[arg(
        long,
        env = "UPLOAD_CHUNK_IDLE_SECS",
        default_value_t = DEFAULT_CHUNK_IDLE_SECS,
        help = "Seconds a chunk body may stall before it is aborted"
    )]
    pub chunk_idle_secs: u64,
    #[arg(
        long,
        env = "UPLOAD_EXPIRE_SECS",
        default_value_t = 0,
        help = "Remove unfinished uploads idle for this many seconds (0 to disable)"
    )]
    pub upload_expire_secs: u64,
}

impl Args {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_size: self.upload_max_size,
            lock_wait: Duration::from_secs(self.lock_wait_secs),
            chunk_idle: Duration::from_secs(self.chunk_idle_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::try_parse_from(["tusdrop"]).expect("parse");
        assert_eq!(args.http_port, DEFAULT_HTTP_PORT);
        assert!(args.https_port.is_none());
        let config = args.store_config();
        assert_eq!(config.max_size, DEFAULT_UPLOAD_MAX_SIZE);
        assert_eq!(config.lock_wait, Duration::from_secs(30));
        assert_eq!(args.upload_expire_secs, 0);
    }
}
