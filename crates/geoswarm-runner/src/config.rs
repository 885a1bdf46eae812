//! Configuration loading and typed config structures for the swarm runner.
//!
//! The configuration lives in `geoswarm.yaml` in the working directory, or
//! at the path named by `GEOSWARM_CONFIG`. Every field has a default, so a
//! missing file or a partial file is fine. Two environment variables
//! override YAML values:
//!
//! - `NATS_URL` overrides `transport.nats_url`
//! - `GEOSWARM_TRANSPORT` overrides `transport.kind` (`nats` or `loopback`)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use geoswarm_interest::{InterestPolicy, MirrorConfig, ReconcileStrategy};
use geoswarm_types::Coordinate;
use serde::Deserialize;

/// Default configuration file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "geoswarm.yaml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_ENV: &str = "GEOSWARM_CONFIG";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is outside its allowed range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level runner configuration, mirroring `geoswarm.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SwarmConfig {
    /// Grid and interest settings.
    #[serde(default)]
    pub grid: GridConfig,

    /// Swarm size, batching and identities.
    #[serde(default)]
    pub swarm: SpawnConfig,

    /// Spawn area and random walk.
    #[serde(default)]
    pub movement: MovementConfig,

    /// Presence mirroring.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Realtime transport selection and timeouts.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Shutdown bounds.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Periodic status reporting.
    #[serde(default)]
    pub status: StatusConfig,
}

impl SwarmConfig {
    /// Load configuration from `GEOSWARM_CONFIG` or `geoswarm.yaml`.
    ///
    /// A missing file yields the defaults. Environment overrides are
    /// applied and the result is validated either way.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or
    /// parsed, or if the resulting values are invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
        if path.exists() {
            Self::from_file(&path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// Environment overrides are not applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NATS_URL` and `GEOSWARM_TRANSPORT` overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `GEOSWARM_TRANSPORT` names an
    /// unknown transport.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("NATS_URL") {
            self.transport.nats_url = val;
        }
        if let Ok(val) = std::env::var("GEOSWARM_TRANSPORT") {
            self.transport.kind = val.parse()?;
        }
        Ok(())
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.grid.cell_size.is_finite() || self.grid.cell_size <= 0.0 {
            return Err(invalid("grid.cell_size", "must be finite and > 0"));
        }
        if self.swarm.batch_size == 0 {
            return Err(invalid("swarm.batch_size", "must be > 0"));
        }
        if !self.swarm.identity_template.contains("{index}") {
            return Err(invalid("swarm.identity_template", "must contain {index}"));
        }
        if self.movement.tick_interval_ms == 0 {
            return Err(invalid("movement.tick_interval_ms", "must be > 0"));
        }
        if !self.movement.origin().is_finite()
            || !self.movement.spawn_spread.is_finite()
            || !self.movement.step.is_finite()
        {
            return Err(invalid("movement", "origin, spawn_spread and step must be finite"));
        }
        if self.presence.enabled && self.presence.eviction_interval_ms == 0 {
            return Err(invalid("presence.eviction_interval_ms", "must be > 0"));
        }
        if self.transport.call_timeout_ms == 0 || self.transport.connect_timeout_ms == 0 {
            return Err(invalid("transport", "timeouts must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}

// -----------------------------------------------------------------------
// Sections
// -----------------------------------------------------------------------

/// Grid and interest configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GridConfig {
    /// Cell edge length in degrees.
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,

    /// Which cells an entity subscribes to.
    #[serde(default)]
    pub policy: InterestPolicy,

    /// How joins and leaves are planned.
    #[serde(default)]
    pub reconcile: ReconcileStrategy,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_size: default_cell_size(),
            policy: InterestPolicy::default(),
            reconcile: ReconcileStrategy::default(),
        }
    }
}

/// Swarm size, spawn batching and account identities.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpawnConfig {
    /// Number of entities to spawn.
    #[serde(default = "default_entity_count")]
    pub entity_count: u32,

    /// Entities spawned concurrently per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Pause between batches in milliseconds.
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,

    /// Absolute run time from swarm start, in seconds. 0 = unlimited.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Identity template; `{index}` is replaced by the entity index.
    #[serde(default = "default_identity_template")]
    pub identity_template: String,

    /// Shared secret used by every simulated account.
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Whether authentication may create missing accounts.
    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    /// Random seed for spawn positions and walks.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl SpawnConfig {
    /// The identity for entity `index`.
    pub fn identity(&self, index: u32) -> String {
        self.identity_template.replace("{index}", &index.to_string())
    }

    /// Pause between batches.
    pub const fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    /// Absolute run time, if bounded.
    pub const fn run_timeout(&self) -> Option<Duration> {
        if self.run_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.run_timeout_secs))
        }
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            entity_count: default_entity_count(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            run_timeout_secs: default_run_timeout_secs(),
            identity_template: default_identity_template(),
            secret: default_secret(),
            create_if_missing: true,
            seed: default_seed(),
        }
    }
}

/// Spawn area and random-walk parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MovementConfig {
    /// Latitude of the spawn area centre.
    #[serde(default = "default_origin_lat")]
    pub origin_lat: f64,

    /// Longitude of the spawn area centre.
    #[serde(default = "default_origin_lon")]
    pub origin_lon: f64,

    /// Width of the spawn square in degrees.
    #[serde(default = "default_spawn_spread")]
    pub spawn_spread: f64,

    /// Maximum per-tick movement span in degrees (each axis moves by up
    /// to half of it in either direction).
    #[serde(default = "default_step")]
    pub step: f64,

    /// Movement tick period in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl MovementConfig {
    /// The spawn area centre.
    pub const fn origin(&self) -> Coordinate {
        Coordinate::new(self.origin_lat, self.origin_lon)
    }

    /// Movement tick period.
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            origin_lat: default_origin_lat(),
            origin_lon: default_origin_lon(),
            spawn_spread: default_spawn_spread(),
            step: default_step(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// Presence mirror configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PresenceConfig {
    /// Whether each driver keeps a presence mirror.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Debounce window for position writes, in milliseconds.
    #[serde(default = "default_min_update_interval_ms")]
    pub min_update_interval_ms: u64,

    /// Age after which a record is evicted, in milliseconds.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,

    /// Eviction cadence in milliseconds.
    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,

    /// Radius beyond which non-group entities are not mirrored, in metres.
    /// 0 disables the filter.
    #[serde(default = "default_visibility_radius_m")]
    pub visibility_radius_m: f64,
}

impl PresenceConfig {
    /// The mirror limits for this configuration.
    pub fn mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            min_update_interval: Duration::from_millis(self.min_update_interval_ms),
            staleness: Duration::from_millis(self.staleness_ms),
            visibility_radius_m: (self.visibility_radius_m > 0.0)
                .then_some(self.visibility_radius_m),
        }
    }

    /// Eviction cadence.
    pub const fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_update_interval_ms: default_min_update_interval_ms(),
            staleness_ms: default_staleness_ms(),
            eviction_interval_ms: default_eviction_interval_ms(),
            visibility_radius_m: default_visibility_radius_m(),
        }
    }
}

/// Which transport implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// NATS pub/sub.
    #[default]
    Nats,
    /// In-process stand-in server.
    Loopback,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(Self::Nats),
            "loopback" => Ok(Self::Loopback),
            other => Err(ConfigError::Invalid {
                field: "transport.kind",
                reason: format!("unknown transport {other:?}"),
            }),
        }
    }
}

/// Transport selection and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportConfig {
    /// Transport implementation.
    #[serde(default)]
    pub kind: TransportKind,

    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Prefix for every NATS subject.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Timeout for authenticate and connect, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for each remote call, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl TransportConfig {
    /// Timeout for authenticate and connect.
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Timeout for each remote call.
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            nats_url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Shutdown bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ShutdownConfig {
    /// Total time allowed for all drivers to drain, in seconds.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ShutdownConfig {
    /// Total drain budget.
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Periodic status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StatusConfig {
    /// Seconds between status log lines. 0 disables reporting.
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

impl StatusConfig {
    /// Status report period, if reporting is enabled.
    pub const fn report_interval(&self) -> Option<Duration> {
        if self.report_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.report_interval_secs))
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

// -----------------------------------------------------------------------
// Defaults
// -----------------------------------------------------------------------

const fn default_true() -> bool {
    true
}

const fn default_cell_size() -> f64 {
    0.002
}

const fn default_entity_count() -> u32 {
    800
}

const fn default_batch_size() -> u32 {
    100
}

const fn default_batch_pause_ms() -> u64 {
    2_000
}

const fn default_run_timeout_secs() -> u64 {
    60
}

fn default_identity_template() -> String {
    String::from("bot{index}@example.com")
}

fn default_secret() -> String {
    String::from("botpassword")
}

const fn default_seed() -> u64 {
    42
}

const fn default_origin_lat() -> f64 {
    37.7749
}

const fn default_origin_lon() -> f64 {
    -122.4194
}

const fn default_spawn_spread() -> f64 {
    0.02
}

const fn default_step() -> f64 {
    0.0002
}

const fn default_tick_interval_ms() -> u64 {
    1_000
}

const fn default_min_update_interval_ms() -> u64 {
    250
}

const fn default_staleness_ms() -> u64 {
    2_000
}

const fn default_eviction_interval_ms() -> u64 {
    500
}

const fn default_visibility_radius_m() -> f64 {
    222.0
}

fn default_nats_url() -> String {
    String::from("nats://localhost:4222")
}

fn default_subject_prefix() -> String {
    String::from("geoswarm")
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_call_timeout_ms() -> u64 {
    2_000
}

const fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    String::from("info")
}

const fn default_report_interval_secs() -> u64 {
    10
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_swarm() {
        let config = SwarmConfig::default();
        assert!((config.grid.cell_size - 0.002).abs() < f64::EPSILON);
        assert_eq!(config.grid.policy, InterestPolicy::DirectionalMinimal);
        assert_eq!(config.swarm.entity_count, 800);
        assert_eq!(config.swarm.batch_size, 100);
        assert_eq!(config.swarm.batch_pause(), Duration::from_secs(2));
        assert_eq!(config.swarm.run_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.movement.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.transport.kind, TransportKind::Nats);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_yaml() {
        let yaml = r"
grid:
  cell_size: 0.004
  policy: full_neighborhood
  reconcile: slab
swarm:
  entity_count: 10
  run_timeout_secs: 0
transport:
  kind: loopback
presence:
  visibility_radius_m: 0
";
        let config = SwarmConfig::parse(yaml).unwrap();
        assert_eq!(config.grid.policy, InterestPolicy::FullNeighborhood);
        assert_eq!(config.grid.reconcile, ReconcileStrategy::Slab);
        assert_eq!(config.swarm.entity_count, 10);
        assert_eq!(config.swarm.batch_size, 100);
        assert_eq!(config.swarm.run_timeout(), None);
        assert_eq!(config.transport.kind, TransportKind::Loopback);
        assert_eq!(config.presence.mirror_config().visibility_radius_m, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            SwarmConfig::parse("grid:\n  cell_size: 0\n"),
            Err(ConfigError::Invalid { field: "grid.cell_size", .. })
        ));
        assert!(matches!(
            SwarmConfig::parse("swarm:\n  batch_size: 0\n"),
            Err(ConfigError::Invalid { field: "swarm.batch_size", .. })
        ));
        assert!(matches!(
            SwarmConfig::parse("movement:\n  tick_interval_ms: 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            SwarmConfig::parse("grid: [not, a, map]"),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn identities_follow_the_template() {
        let spawn = SpawnConfig::default();
        assert_eq!(spawn.identity(7), "bot7@example.com");
    }

    #[test]
    fn transport_kind_parses_case_insensitively() {
        assert_eq!("LOOPBACK".parse::<TransportKind>().unwrap(), TransportKind::Loopback);
        assert_eq!("nats".parse::<TransportKind>().unwrap(), TransportKind::Nats);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
