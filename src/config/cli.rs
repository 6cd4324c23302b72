use std::path::PathBuf;

use clap::{Args, Parser, builder::BoolishValueParser};

/// Command-line arguments for the roundcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "roundcache",
    version,
    about = "Coalescing reverse proxy cache aligned to round boundaries"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ROUNDCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the upstream origin every request is forwarded to.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Override the upstream request timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,

    /// Toggle response caching and coalescing.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the maximum number of stored responses.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<u64>,

    /// Override the largest storable response body in bytes.
    #[arg(long = "cache-max-body-bytes", value_name = "BYTES")]
    pub cache_max_body_bytes: Option<u64>,

    /// Override the unix timestamp (seconds) at which round zero started.
    #[arg(long = "round-genesis-timestamp", value_name = "SECONDS")]
    pub round_genesis_timestamp: Option<i64>,

    /// Override the round length in milliseconds.
    #[arg(long = "round-duration-ms", value_name = "MILLISECONDS")]
    pub round_duration_ms: Option<u64>,
}
