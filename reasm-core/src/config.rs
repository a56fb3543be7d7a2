#![forbid(unsafe_code)]

//! Configuration handling. Parses a TOML file into a strongly-typed structure. Every key is
//! optional; anything omitted falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use tracing::debug;

use crate::{ReasmError, ReasmResult};

/// Environment variable naming the configuration file used by the driver.
pub const CONFIG_ENV: &str = "REASM_CONFIG";

/// Top-level configuration shared by the engine, the pipeline and the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasmConfig {
    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// Buffer caps and flow lifecycle settings.
    pub reassembly: ReassemblyConfig,

    /// Ingestion queue and scheduling settings.
    pub pipeline: PipelineConfig,
}

impl Default for ReasmConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            reassembly: ReassemblyConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Limits enforced by the flow table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Out-of-order bytes buffered across all flows.
    pub max_buffered_bytes: usize,
    /// Out-of-order segments buffered across all flows.
    pub max_buffered_segments: usize,
    /// Out-of-order bytes buffered by a single flow.
    pub max_flow_buffered_bytes: usize,
    /// Out-of-order segments buffered by a single flow.
    pub max_flow_buffered_segments: usize,
    /// Flows tracked at once before the least recently active one is evicted.
    pub max_flows: usize,
    /// Pick a direction up mid-stream when its SYN was never captured. Delivery then starts at
    /// the lowest buffered sequence once `missing_init_delay_ms` has passed, the buffer fills,
    /// or a FIN closes a gap-free run.
    pub allow_missing_init: bool,
    /// Capture time a SYN-less direction buffers before it is picked up by the idle sweep.
    pub missing_init_delay_ms: u64,
    /// Flows without traffic for this long are force-completed by the idle sweep.
    pub idle_timeout_secs: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 64 * 1024 * 1024,
            max_buffered_segments: 65_536,
            max_flow_buffered_bytes: 1024 * 1024,
            max_flow_buffered_segments: 1024,
            max_flows: 100_000,
            allow_missing_init: true,
            missing_init_delay_ms: 1000,
            idle_timeout_secs: 120,
        }
    }
}

impl ReassemblyConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn missing_init_delay(&self) -> Duration {
        Duration::from_millis(self.missing_init_delay_ms)
    }

    /// Reject combinations the flow table cannot honour.
    pub fn validate(&self) -> ReasmResult<()> {
        let non_zero = [
            ("max_buffered_bytes", self.max_buffered_bytes),
            ("max_buffered_segments", self.max_buffered_segments),
            ("max_flow_buffered_bytes", self.max_flow_buffered_bytes),
            ("max_flow_buffered_segments", self.max_flow_buffered_segments),
            ("max_flows", self.max_flows),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ReasmError::InvalidConfig(format!("reassembly.{name} must be non-zero")));
            }
        }
        if self.max_flow_buffered_bytes > self.max_buffered_bytes {
            return Err(ReasmError::InvalidConfig(format!(
                "reassembly.max_flow_buffered_bytes ({}) exceeds max_buffered_bytes ({})",
                self.max_flow_buffered_bytes, self.max_buffered_bytes
            )));
        }
        if self.max_flow_buffered_segments > self.max_buffered_segments {
            return Err(ReasmError::InvalidConfig(format!(
                "reassembly.max_flow_buffered_segments ({}) exceeds max_buffered_segments ({})",
                self.max_flow_buffered_segments, self.max_buffered_segments
            )));
        }
        Ok(())
    }
}

/// Settings for the multi-source ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the bounded queue between capture sources and the engine.
    pub queue_capacity: usize,
    /// Period of the idle-flow sweep. Zero disables the sweep.
    pub flush_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            flush_interval_ms: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms))
    }

    pub fn validate(&self) -> ReasmResult<()> {
        if self.queue_capacity == 0 {
            return Err(ReasmError::InvalidConfig(
                "pipeline.queue_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ReasmConfig {
    /// Load and validate a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ReasmResult<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg = Self::from_toml_str(&data)?;
        debug!(path = %path.as_ref().display(), "loaded configuration");
        Ok(cfg)
    }

    /// Alias of [`from_file`](Self::from_file).
    pub fn load<P: AsRef<Path>>(path: P) -> ReasmResult<Self> {
        Self::from_file(path)
    }

    pub fn from_toml_str(data: &str) -> ReasmResult<Self> {
        let cfg = toml::from_str::<ReasmConfig>(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> ReasmResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ReasmResult<()> {
        self.reassembly.validate()?;
        self.pipeline.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        ReasmConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = ReasmConfig::from_toml_str(
            r#"
            log_level = "debug"

            [reassembly]
            max_flow_buffered_segments = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(cfg.reassembly.max_flow_buffered_segments, 2);
        assert_eq!(cfg.reassembly.max_flows, ReassemblyConfig::default().max_flows);
        assert_eq!(cfg.pipeline, PipelineConfig::default());
    }

    #[test]
    fn per_flow_cap_above_global_is_rejected() {
        let err = ReasmConfig::from_toml_str(
            r#"
            [reassembly]
            max_buffered_bytes = 100
            max_flow_buffered_bytes = 200
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ReasmError::InvalidConfig(_)));
    }

    #[test]
    fn zero_queue_is_rejected() {
        let err = ReasmConfig::from_toml_str("[pipeline]\nqueue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn from_file_roundtrips_rendered_config() {
        let mut cfg = ReasmConfig::default();
        cfg.pipeline.queue_capacity = 7;
        cfg.reassembly.allow_missing_init = false;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cfg.to_toml_string().unwrap().as_bytes()).unwrap();

        let loaded = ReasmConfig::load(file.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_flush_interval_disables_sweep() {
        let cfg = PipelineConfig { flush_interval_ms: 0, ..PipelineConfig::default() };
        assert!(cfg.flush_interval().is_none());
    }
}
