use crate::backoff::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
use crate::scheduler::DuplicatePolicy;
use adt_core::env::{env_true, env_value, resolve_parsed, resolve_string, resolve_with};
use adt_core::protocol::ParseFailurePolicy;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STATE_FILE: &str = "agent.conf";
pub const DEFAULT_LOG_DIR: &str = ".adt/logs";
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "adt-agent")]
pub struct Args {
    /// JSON file holding `serverURL` and the assigned agent `id`.
    #[arg(long, default_value = "")]
    pub state_file: String,
    /// Coordinator base url; overrides the one stored in the state file.
    #[arg(long)]
    pub server_url: Option<String>,
    /// Seconds before the first reconnect attempt.
    #[arg(long)]
    pub reconnect_initial: Option<u64>,
    #[arg(long)]
    pub reconnect_multiplier: Option<f64>,
    #[arg(long)]
    pub reconnect_max: Option<u64>,
    /// Random spread applied to each delay, as a fraction of it.
    #[arg(long)]
    pub reconnect_jitter: Option<f64>,
    #[arg(long, value_enum)]
    pub duplicate_policy: Option<DuplicatePolicy>,
    #[arg(long)]
    pub queue_capacity: Option<usize>,
    #[arg(long, default_value_t = false)]
    pub strict_protocol: bool,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub state_file: PathBuf,
    pub server_url: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub duplicate_policy: DuplicatePolicy,
    pub queue_capacity: usize,
    pub parse_policy: ParseFailurePolicy,
    pub debug: bool,
    pub log_dir: String,
}

impl AgentConfig {
    pub fn from_args(args: Args) -> Self {
        Self {
            state_file: PathBuf::from(resolve_string(
                &args.state_file,
                "ADT_AGENT_STATE",
                DEFAULT_STATE_FILE,
            )),
            server_url: args.server_url.clone().or_else(|| env_value("ADT_SERVER_URL")),
            reconnect: resolve_reconnect(&args),
            duplicate_policy: resolve_duplicate_policy(args.duplicate_policy),
            queue_capacity: resolve_parsed(
                args.queue_capacity,
                "ADT_QUEUE_CAPACITY",
                DEFAULT_QUEUE_CAPACITY,
            )
            .max(1),
            parse_policy: ParseFailurePolicy::from_strict(
                args.strict_protocol || env_true("ADT_STRICT_PROTOCOL"),
            ),
            debug: args.debug || env_true("ADT_DEBUG"),
            log_dir: resolve_string(&args.log_dir, "ADT_LOG_DIR", DEFAULT_LOG_DIR),
        }
    }
}

pub fn load_config() -> AgentConfig {
    AgentConfig::from_args(Args::parse())
}

fn resolve_reconnect(args: &Args) -> ReconnectPolicy {
    let default_secs = DEFAULT_RECONNECT_DELAY.as_secs();
    let initial = Duration::from_secs(resolve_parsed(
        args.reconnect_initial,
        "ADT_RECONNECT_INITIAL",
        default_secs,
    ));
    let max = Duration::from_secs(resolve_parsed(
        args.reconnect_max,
        "ADT_RECONNECT_MAX",
        default_secs,
    ));
    ReconnectPolicy {
        initial,
        multiplier: resolve_parsed(args.reconnect_multiplier, "ADT_RECONNECT_MULTIPLIER", 1.0),
        max: max.max(initial),
        jitter: resolve_parsed(args.reconnect_jitter, "ADT_RECONNECT_JITTER", 0.0)
            .clamp(0.0, 1.0),
    }
}

fn resolve_duplicate_policy(flag: Option<DuplicatePolicy>) -> DuplicatePolicy {
    resolve_with(
        flag,
        "ADT_DUPLICATE_POLICY",
        DuplicatePolicy::default(),
        |raw| DuplicatePolicy::from_str(raw, true).ok(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reconnect_every_ten_seconds() {
        let args = Args::parse_from(["adt-agent"]);
        assert_eq!(args.reconnect_initial, None);
        assert_eq!(args.duplicate_policy, None);
        assert_eq!(resolve_reconnect(&args).initial, DEFAULT_RECONNECT_DELAY);
    }

    #[test]
    fn backoff_flags_build_the_policy() {
        let args = Args::parse_from([
            "adt-agent",
            "--state-file",
            "/tmp/agent.conf",
            "--server-url",
            "http://c2.local:8080",
            "--reconnect-initial",
            "1",
            "--reconnect-multiplier",
            "2",
            "--reconnect-max",
            "30",
            "--reconnect-jitter",
            "3",
            "--duplicate-policy",
            "replace",
        ]);
        let config = AgentConfig::from_args(args);
        assert_eq!(config.state_file, PathBuf::from("/tmp/agent.conf"));
        assert_eq!(config.server_url.as_deref(), Some("http://c2.local:8080"));
        assert_eq!(config.reconnect.initial, Duration::from_secs(1));
        assert_eq!(config.reconnect.max, Duration::from_secs(30));
        assert_eq!(config.reconnect.multiplier, 2.0);
        assert_eq!(config.reconnect.jitter, 1.0);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Replace);
    }

    #[test]
    fn duplicate_policy_reads_the_environment() {
        std::env::set_var("ADT_DUPLICATE_POLICY", "Reject");
        assert_eq!(resolve_duplicate_policy(None), DuplicatePolicy::Reject);
        assert_eq!(
            resolve_duplicate_policy(Some(DuplicatePolicy::Allow)),
            DuplicatePolicy::Allow
        );
        std::env::remove_var("ADT_DUPLICATE_POLICY");
    }
}
