use adt_core::env::{env_true, resolve_parsed, resolve_string};
use adt_core::protocol::ParseFailurePolicy;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE: &str = "adt.db";
pub const DEFAULT_LOG_DIR: &str = ".adt/logs";
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "adt-server")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub database: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Seconds between keepalive pings; 0 disables them.
    #[arg(long)]
    pub ping_interval: Option<u64>,
    #[arg(long)]
    pub write_timeout: Option<u64>,
    #[arg(long)]
    pub queue_capacity: Option<usize>,
    /// Answer undecodable frames with an error envelope instead of dropping them.
    #[arg(long, default_value_t = false)]
    pub strict_protocol: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub database: PathBuf,
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub parse_policy: ParseFailurePolicy,
    pub log_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            database: PathBuf::from(DEFAULT_DATABASE),
            debug: false,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            parse_policy: ParseFailurePolicy::Drop,
            log_dir: DEFAULT_LOG_DIR.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_args(args: Args) -> Self {
        Self {
            addr: resolve_string(&args.addr, "ADT_SERVER_ADDR", DEFAULT_ADDR),
            database: PathBuf::from(resolve_string(
                &args.database,
                "ADT_DATABASE",
                DEFAULT_DATABASE,
            )),
            debug: args.debug || env_true("ADT_DEBUG"),
            ping_interval: Duration::from_secs(resolve_parsed(
                args.ping_interval,
                "ADT_PING_INTERVAL",
                DEFAULT_PING_INTERVAL_SECS,
            )),
            write_timeout: Duration::from_secs(resolve_parsed(
                args.write_timeout,
                "ADT_WRITE_TIMEOUT",
                DEFAULT_WRITE_TIMEOUT_SECS,
            )),
            queue_capacity: resolve_parsed(
                args.queue_capacity,
                "ADT_QUEUE_CAPACITY",
                DEFAULT_QUEUE_CAPACITY,
            )
            .max(1),
            parse_policy: ParseFailurePolicy::from_strict(
                args.strict_protocol || env_true("ADT_STRICT_PROTOCOL"),
            ),
            log_dir: resolve_string(&args.log_dir, "ADT_LOG_DIR", DEFAULT_LOG_DIR),
        }
    }
}

pub fn load_config() -> ServerConfig {
    ServerConfig::from_args(Args::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_win_over_defaults() {
        let args = Args::parse_from([
            "adt-server",
            "--addr",
            "0.0.0.0:9000",
            "--database",
            "/tmp/c2.db",
            "--ping-interval",
            "0",
            "--queue-capacity",
            "0",
            "--strict-protocol",
        ]);
        let config = ServerConfig::from_args(args);
        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.database, PathBuf::from("/tmp/c2.db"));
        assert!(config.ping_interval.is_zero());
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.parse_policy, ParseFailurePolicy::Reply);
    }

    #[test]
    fn omitted_numeric_flags_stay_unset() {
        let args = Args::parse_from(["adt-server"]);
        assert_eq!(args.ping_interval, None);
        assert_eq!(args.write_timeout, None);
        assert_eq!(args.queue_capacity, None);
    }
}
