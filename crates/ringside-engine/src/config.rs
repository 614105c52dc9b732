//! Engine configuration.
//!
//! Every knob is optional in the TOML file; missing fields fall back to the
//! protocol defaults, so an empty file and no file at all behave the same.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ringside_decision::{DecisionConfig, ScoreWeights};
use ringside_metrics::AggregatorConfig;
use ringside_protocol::{
    DEFAULT_ACCEPT_TIMEOUT_SECS, DEFAULT_AGENT_CALL_TIMEOUT_MS, DEFAULT_AGENT_GRACE_SECS,
    DEFAULT_JOIN_TIMEOUT_SECS, DEFAULT_MAX_FIGHT_SECS, DEFAULT_MISSED_TICKS_BEFORE_ABSENT,
    DEFAULT_PERSIST_RETRY_BACKOFF_MS, DEFAULT_PERSIST_RETRY_MAX, DEFAULT_SAMPLE_INTERVAL_SECS,
    DEFAULT_SKEW_TOLERANCE_MS, DEFAULT_VOLUME_DRAW_THRESHOLD,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// All engine tunables. Flat on purpose so the TOML file reads as a plain
/// list of knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds the challengee has to accept or decline.
    pub accept_timeout_secs: u64,
    /// Seconds both participants have to show up once a fight type is chosen.
    pub join_timeout_secs: u64,
    /// Hard ceiling on fight duration.
    pub max_fight_secs: u64,
    /// Seconds between watcher polls.
    pub sample_interval_secs: u64,
    /// Composite-score gap under which a volume fight is a draw.
    pub volume_draw_threshold: f64,
    /// Seconds to wait for a substitute watcher after an agent failure.
    pub agent_grace_secs: u64,
    /// Bound on any single watcher call; an elapsed call is an agent failure.
    pub agent_call_timeout_ms: u64,
    /// Ticks without a presence sample before a participant counts as gone.
    pub missed_ticks_before_absent: u32,
    /// Accepted backwards clock skew for out-of-order samples.
    pub skew_tolerance_ms: i64,
    /// Attempts to persist a decided outcome before giving up.
    pub persist_retry_max: u32,
    /// Base backoff between persistence attempts; doubles per attempt.
    pub persist_retry_backoff_ms: u64,
    /// Both participants dropping in the same tick: draw (true) or void.
    pub draw_on_simultaneous_drop: bool,
    /// Missing the join deadline voids immediately (true) or grants one
    /// extension of the same length.
    pub void_on_join_timeout: bool,
    /// Volume scoring weight for speaking duration.
    pub duration_weight: f64,
    /// Volume scoring weight for average volume.
    pub average_weight: f64,
    /// Volume scoring weight for peak volume.
    pub peak_weight: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let weights = ScoreWeights::default();
        Self {
            accept_timeout_secs: DEFAULT_ACCEPT_TIMEOUT_SECS,
            join_timeout_secs: DEFAULT_JOIN_TIMEOUT_SECS,
            max_fight_secs: DEFAULT_MAX_FIGHT_SECS,
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL_SECS,
            volume_draw_threshold: DEFAULT_VOLUME_DRAW_THRESHOLD,
            agent_grace_secs: DEFAULT_AGENT_GRACE_SECS,
            agent_call_timeout_ms: DEFAULT_AGENT_CALL_TIMEOUT_MS,
            missed_ticks_before_absent: DEFAULT_MISSED_TICKS_BEFORE_ABSENT,
            skew_tolerance_ms: DEFAULT_SKEW_TOLERANCE_MS,
            persist_retry_max: DEFAULT_PERSIST_RETRY_MAX,
            persist_retry_backoff_ms: DEFAULT_PERSIST_RETRY_BACKOFF_MS,
            draw_on_simultaneous_drop: true,
            void_on_join_timeout: true,
            duration_weight: weights.duration,
            average_weight: weights.average,
            peak_weight: weights.peak,
        }
    }
}

impl EngineConfig {
    /// Load configuration: an explicit path must parse; otherwise the
    /// platform config file is used when present, defaults when not.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<platform config dir>/ringside/config.toml`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ringside").join("config.toml"))
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "accept_timeout_secs must be positive".into(),
            ));
        }
        if self.join_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "join_timeout_secs must be positive".into(),
            ));
        }
        if self.max_fight_secs == 0 {
            return Err(ConfigError::Invalid(
                "max_fight_secs must be positive".into(),
            ));
        }
        if self.sample_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sample_interval_secs must be positive".into(),
            ));
        }
        if self.sample_interval_secs >= self.max_fight_secs {
            return Err(ConfigError::Invalid(
                "sample_interval_secs must be shorter than max_fight_secs".into(),
            ));
        }
        if self.agent_call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "agent_call_timeout_ms must be positive".into(),
            ));
        }
        if self.missed_ticks_before_absent == 0 {
            return Err(ConfigError::Invalid(
                "missed_ticks_before_absent must be at least 1".into(),
            ));
        }
        if self.skew_tolerance_ms < 0 {
            return Err(ConfigError::Invalid(
                "skew_tolerance_ms must not be negative".into(),
            ));
        }
        self.decision_config()
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(())
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn max_fight(&self) -> Duration {
        Duration::from_secs(self.max_fight_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn agent_grace(&self) -> Duration {
        Duration::from_secs(self.agent_grace_secs)
    }

    pub fn agent_call_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_call_timeout_ms)
    }

    pub fn persist_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_retry_backoff_ms)
    }

    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            weights: ScoreWeights {
                duration: self.duration_weight,
                average: self.average_weight,
                peak: self.peak_weight,
            },
            draw_threshold: self.volume_draw_threshold,
            draw_on_simultaneous_drop: self.draw_on_simultaneous_drop,
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            skew_tolerance_ms: self.skew_tolerance_ms,
            missed_ticks_before_absent: self.missed_ticks_before_absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.accept_timeout_secs, DEFAULT_ACCEPT_TIMEOUT_SECS);
        assert_eq!(config.max_fight_secs, DEFAULT_MAX_FIGHT_SECS);
        assert!(config.draw_on_simultaneous_drop);
        assert!(config.void_on_join_timeout);
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "accept_timeout_secs = 10").unwrap();
        writeln!(file, "volume_draw_threshold = 0.2").unwrap();
        let config = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.accept_timeout_secs, 10);
        assert_eq!(config.volume_draw_threshold, 0.2);
        assert_eq!(config.join_timeout_secs, DEFAULT_JOIN_TIMEOUT_SECS);
        assert_eq!(config.persist_retry_max, DEFAULT_PERSIST_RETRY_MAX);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = EngineConfig::from_path(Path::new("/nonexistent/ringside.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_garbage_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "accept_timeout_secs = \"soon\"").unwrap();
        let err = EngineConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = EngineConfig::default();
        config.join_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sample_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_must_fit_inside_max_duration() {
        let mut config = EngineConfig::default();
        config.sample_interval_secs = config.max_fight_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_decision_settings_rejected() {
        let mut config = EngineConfig::default();
        config.volume_draw_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.duration_weight = 0.0;
        config.average_weight = 0.0;
        config.peak_weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = EngineConfig::default();
        let rendered = toml::to_string(&config).unwrap();
        let restored: EngineConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(restored.max_fight_secs, config.max_fight_secs);
        assert_eq!(restored.duration_weight, config.duration_weight);
    }
}
