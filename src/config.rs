// =============================================================================
// config.rs - THE GRAND CONFIGURATION CATHEDRAL
// =============================================================================
//
// Every tunable parameter in the entire engine lives here. Knobs for knobs.
// Each flag can also arrive through an environment variable (a .env file is
// auto-loaded before parsing), because typing --interval 5 into a terminal
// for the four hundredth time builds no character.
//
// Validation is deliberately unforgiving: a bad flag combination exits with
// code 1 and one line on stderr BEFORE a single MQTT connection is
// attempted. A misconfigured load test that runs anyway produces numbers
// someone will put in a slide deck.
// =============================================================================

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rumqttc::QoS;
use thiserror::Error;

/// When to split the fleet over multiple shard processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SplitMode {
    /// Always run single-process, however large the fleet.
    Never,
    /// Split when the fleet exceeds --max-clients-per-process.
    Auto,
    /// Always spawn shard processes, even for tiny fleets.
    Always,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--interval must be greater than 0")]
    NonPositiveInterval,
    #[error("--ramp-wait cannot be negative")]
    NegativeRampWait,
    #[error("--duration cannot be negative")]
    NegativeDuration,
    #[error("--count must be greater than 0")]
    NonPositiveCount,
    #[error("--metrics-refresh must be greater than 0 when the dashboard is enabled")]
    NonPositiveRefresh,
    #[error("use --ramp or --ramp-percentages, but not both at the same time")]
    ConflictingRamps,
    #[error("--provision requires --tb-url, --tb-username and --tb-password (or TB_URL, TB_USERNAME, TB_PASSWORD)")]
    MissingProvisioningCredentials,
}

/// The full CLI surface of the simulator. One struct for the orchestrator
/// and the shard runtime; shards receive an echo of these flags.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fleet_surge_engine",
    version,
    about = "Asynchronous MQTT stress simulator for ThingsBoard-class brokers"
)]
pub struct Config {
    /// MQTT broker host.
    #[arg(long, env = "MQTT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// MQTT broker port.
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,

    /// Path to the JSON token store (name -> token map, or a bare list).
    #[arg(long, env = "TOKENS_FILE", default_value = "data/provisioning/tokens.json")]
    pub tokens_file: PathBuf,

    /// Prefix for synthesizing tokens when no token store exists.
    #[arg(long)]
    pub token_prefix: Option<String>,

    /// Total number of devices to simulate (0 = all available tokens).
    #[arg(long, env = "DEVICE_COUNT", default_value_t = 0)]
    pub device_count: usize,

    /// Offset into the token store, for running multiple instances.
    #[arg(long, default_value_t = 0)]
    pub start_id: usize,

    /// Number of devices to take from start-id (shard slicing).
    #[arg(long)]
    pub count: Option<usize>,

    /// Telemetry publish interval in seconds.
    #[arg(long, env = "PUBLISH_INTERVAL_SEC", default_value_t = 5.0, allow_negative_numbers = true)]
    pub interval: f64,

    /// MQTT topic telemetry is published on.
    #[arg(long, env = "MQTT_TOPIC", default_value = "v1/devices/me/telemetry")]
    pub topic: String,

    /// MQTT QoS for telemetry publishes.
    #[arg(long, env = "MQTT_QOS", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: u8,

    /// Total test duration in seconds (0 = run until interrupted).
    #[arg(long, env = "SIM_DURATION_SEC", default_value_t = 0.0, allow_negative_numbers = true)]
    pub duration: f64,

    /// Ramp stages as cumulative device counts, e.g. --ramp 100 500 1000.
    #[arg(long, env = "RAMP_COUNTS", num_args = 1.., value_delimiter = ' ')]
    pub ramp: Option<Vec<u64>>,

    /// Ramp stages as cumulative percentages, e.g. --ramp-percentages 25 50 100.
    #[arg(long, env = "RAMP_PERCENTAGES", num_args = 1.., value_delimiter = ' ')]
    pub ramp_percentages: Option<Vec<String>>,

    /// Seconds to dwell between ramp stages.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub ramp_wait: f64,

    /// Seconds between periodic reports.
    #[arg(long, env = "REPORT_INTERVAL_SEC", default_value_t = 15.0)]
    pub report_interval: f64,

    /// Directory for the JSONL event logs.
    #[arg(long, default_value = "data/logs")]
    pub log_dir: PathBuf,

    /// Directory for the CSV metrics files.
    #[arg(long, default_value = "data/metrics")]
    pub metrics_dir: PathBuf,

    /// Initial reconnect backoff in seconds.
    #[arg(long, default_value_t = 1.0)]
    pub backoff_base: f64,

    /// Maximum reconnect backoff in seconds.
    #[arg(long, default_value_t = 30.0)]
    pub backoff_max: f64,

    /// Host the metrics dashboard binds to.
    #[arg(long, env = "METRICS_HOST", default_value = "127.0.0.1")]
    pub metrics_host: String,

    /// Port the metrics dashboard binds to.
    #[arg(long, env = "METRICS_PORT", default_value_t = 5050)]
    pub metrics_port: u16,

    /// Dashboard refresh interval in milliseconds.
    #[arg(long, env = "METRICS_REFRESH_MS", default_value_t = 2000)]
    pub metrics_refresh: u64,

    /// Disable the metrics dashboard entirely.
    #[arg(long)]
    pub disable_dashboard: bool,

    /// Maximum MQTT clients per process before sharding.
    #[arg(long, default_value_t = 400)]
    pub max_clients_per_process: usize,

    /// When to fan out into shard processes.
    #[arg(long, value_enum, default_value_t = SplitMode::Auto)]
    pub split: SplitMode,

    /// Lead time in seconds between gate assembly and the first burst.
    #[arg(long, env = "SIM_START_LEAD_TIME", default_value_t = 0.3)]
    pub start_lead_time: f64,

    /// Seconds to wait for shards to exit gracefully before killing them.
    #[arg(long, default_value_t = 10.0)]
    pub shutdown_grace: f64,

    /// Provision the fleet against ThingsBoard before running.
    #[arg(long)]
    pub provision: bool,

    /// ThingsBoard base URL for provisioning.
    #[arg(long, env = "TB_URL")]
    pub tb_url: Option<String>,

    /// ThingsBoard tenant username for provisioning.
    #[arg(long, env = "TB_USERNAME")]
    pub tb_username: Option<String>,

    /// ThingsBoard tenant password for provisioning.
    #[arg(long, env = "TB_PASSWORD")]
    pub tb_password: Option<String>,

    /// Device name prefix used by the provisioner and synthetic tokens.
    #[arg(long, env = "DEVICE_PREFIX", default_value = "sim")]
    pub device_prefix: String,

    /// Device label attached by the provisioner.
    #[arg(long, env = "DEVICE_LABEL", default_value = "sim-lab")]
    pub device_label: String,

    /// Device type attached by the provisioner.
    #[arg(long, env = "DEVICE_TYPE", default_value = "sensor")]
    pub device_type: String,

    /// Device profile id to assign (defaults to the tenant default).
    #[arg(long, env = "DEVICE_PROFILE_ID")]
    pub device_profile_id: Option<String>,

    /// Internal: run as a shard worker instead of orchestrating.
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Internal: endpoint shards report snapshots to.
    #[arg(long, hide = true)]
    pub aggregator_endpoint: Option<String>,

    /// Internal: identity of this shard in aggregator reports.
    #[arg(long, hide = true)]
    pub shard_id: Option<String>,
}

impl Config {
    /// Reject configurations the engine refuses to run with. Called once
    /// at startup, before any token is read or socket opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval <= 0.0 {
            return Err(ConfigError::NonPositiveInterval);
        }
        if self.ramp_wait < 0.0 {
            return Err(ConfigError::NegativeRampWait);
        }
        if self.duration < 0.0 {
            return Err(ConfigError::NegativeDuration);
        }
        if self.count == Some(0) {
            return Err(ConfigError::NonPositiveCount);
        }
        if !self.disable_dashboard && self.metrics_refresh == 0 {
            return Err(ConfigError::NonPositiveRefresh);
        }
        if self.ramp.is_some() && self.ramp_percentages.is_some() {
            return Err(ConfigError::ConflictingRamps);
        }
        if self.provision {
            let missing = |value: &Option<String>| value.as_deref().unwrap_or("").is_empty();
            if missing(&self.tb_url) || missing(&self.tb_username) || missing(&self.tb_password) {
                return Err(ConfigError::MissingProvisioningCredentials);
            }
        }
        Ok(())
    }

    pub fn mqtt_qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    /// Identity of this shard in aggregator reports: explicit --shard-id,
    /// or derived from the slice.
    pub fn effective_shard_id(&self, fleet_size: usize) -> String {
        self.shard_id
            .clone()
            .unwrap_or_else(|| format!("{:05}-{:05}", self.start_id, fleet_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["fleet_surge_engine"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).expect("valid arguments")
    }

    #[test]
    fn test_defaults_validate() {
        let config = parse(&[]);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1883);
        assert_eq!(config.qos, 1);
        assert_eq!(config.topic, "v1/devices/me/telemetry");
        assert_eq!(config.split, SplitMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_both_ramp_forms_are_rejected() {
        let config = parse(&["--ramp", "10", "20", "--ramp-percentages", "50", "100"]);
        assert_eq!(config.validate(), Err(ConfigError::ConflictingRamps));
    }

    #[test]
    fn test_nonpositive_interval_is_rejected() {
        let config = parse(&["--interval", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveInterval));
        let config = parse(&["--interval", "-1.5"]);
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveInterval));
    }

    #[test]
    fn test_negative_waits_and_durations_are_rejected() {
        let config = parse(&["--ramp-wait", "-0.1"]);
        assert_eq!(config.validate(), Err(ConfigError::NegativeRampWait));
        let config = parse(&["--duration", "-2"]);
        assert_eq!(config.validate(), Err(ConfigError::NegativeDuration));
    }

    #[test]
    fn test_zero_count_is_rejected() {
        let config = parse(&["--count", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveCount));
    }

    #[test]
    fn test_refresh_only_matters_with_dashboard() {
        let config = parse(&["--metrics-refresh", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveRefresh));
        let config = parse(&["--metrics-refresh", "0", "--disable-dashboard"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_provision_needs_credentials() {
        let config = parse(&["--provision"]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingProvisioningCredentials)
        );
        let config = parse(&[
            "--provision",
            "--tb-url",
            "http://localhost:8080",
            "--tb-username",
            "tenant@example.com",
            "--tb-password",
            "hunter2",
        ]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_qos_bounds_and_mapping() {
        assert!(Config::try_parse_from(["x", "--qos", "3"]).is_err());
        assert!(matches!(parse(&["--qos", "0"]).mqtt_qos(), QoS::AtMostOnce));
        assert!(matches!(parse(&["--qos", "1"]).mqtt_qos(), QoS::AtLeastOnce));
        assert!(matches!(parse(&["--qos", "2"]).mqtt_qos(), QoS::ExactlyOnce));
    }

    #[test]
    fn test_internal_worker_flags_parse() {
        let config = parse(&[
            "--worker",
            "--start-id",
            "400",
            "--count",
            "400",
            "--aggregator-endpoint",
            "http://127.0.0.1:5050/api/shard",
            "--shard-id",
            "00400-00400",
            "--disable-dashboard",
        ]);
        assert!(config.worker);
        assert_eq!(config.effective_shard_id(400), "00400-00400");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shard_id_derives_from_slice_when_absent() {
        let config = parse(&["--start-id", "800"]);
        assert_eq!(config.effective_shard_id(200), "00800-00200");
    }
}
