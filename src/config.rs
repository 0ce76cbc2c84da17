//! CLI flags and environment-variable overlay (spec §6). Every flag also
//! binds to an environment variable (`clap`'s `env` feature), following the
//! original's Viper-style automatic env binding
//! (`examples/original_source/pkg/config/config.go`): dashes in flag names
//! become underscores in the matching env var, e.g. `--remote-write-url`
//! reads `REMOTE_WRITE_URL` if the flag is absent.

use std::time::Duration;

use clap::Parser;

use crate::election::{etcd::EtcdConfig, k8s::K8sConfig, redis::RedisConfig, Backend};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "df-remote-write-forwarder",
    about = "Leader-gated Prometheus remote-write forwarder"
)]
pub struct Config {
    #[arg(short = 'p', long, env = "PORT", default_value_t = 80)]
    pub port: u16,

    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long = "election-enabled", env = "ELECTION_ENABLED", default_value_t = true)]
    pub election_enabled: bool,

    #[arg(long, env = "ELECTOR", value_enum, default_value_t = Backend::K8s)]
    pub elector: Backend,

    #[arg(
        long = "prometheus-scrape-interval",
        env = "PROMETHEUS_SCRAPE_INTERVAL",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub prometheus_scrape_interval: Duration,

    #[command(flatten)]
    pub remote_write: RemoteWriteConfig,

    #[command(flatten)]
    pub k8s: K8sConfig,

    #[command(flatten)]
    pub etcd: EtcdConfig,

    #[command(flatten)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RemoteWriteConfig {
    #[arg(long = "remote-write-url", env = "REMOTE_WRITE_URL")]
    pub url: String,

    #[arg(
        long = "remote-write-timeout",
        env = "REMOTE_WRITE_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub timeout: Duration,

    #[arg(long = "remote-write-ca-file", env = "REMOTE_WRITE_CA_FILE", default_value = "")]
    pub ca_file: String,

    #[arg(long = "remote-write-cert-file", env = "REMOTE_WRITE_CERT_FILE", default_value = "")]
    pub cert_file: String,

    #[arg(long = "remote-write-key-file", env = "REMOTE_WRITE_KEY_FILE", default_value = "")]
    pub key_file: String,

    #[arg(long = "remote-write-server-name", env = "REMOTE_WRITE_SERVER_NAME", default_value = "")]
    pub server_name: String,

    #[arg(long = "remote-write-insecure", env = "REMOTE_WRITE_INSECURE", default_value_t = false)]
    pub insecure: bool,
}

pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

impl Config {
    /// `grace`, per spec §3/§4.3, equals the configured scrape interval.
    pub fn grace(&self) -> Duration {
        self.prometheus_scrape_interval
    }
}
