use gpusub_hw::PreemptionMode;
use serde::Deserialize;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "GPUSUB_";

/// Submission tunables.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    /// Emit a stalling barrier before switching the preemption register.
    pub preemption_cmd_sync_programming: bool,
    /// End batches with a jump back into the CSR ring instead of BATCH_BUFFER_END.
    pub direct_submission: bool,
    pub command_queue_buffer_count: usize,
    pub command_queue_buffer_size: u64,
    pub command_list_buffer_size: u64,
    pub heap_size: u64,
    pub force_preemption_mode: Option<PreemptionMode>,
    /// Zero-fill memory prefetch packets at submission time.
    pub noop_memory_prefetch: bool,
    pub sync_buffer_size: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            preemption_cmd_sync_programming: true,
            direct_submission: false,
            command_queue_buffer_count: 2,
            command_queue_buffer_size: 64 * 1024,
            command_list_buffer_size: 64 * 1024,
            heap_size: 64 * 1024,
            force_preemption_mode: None,
            noop_memory_prefetch: false,
            sync_buffer_size: 4 * 1024,
        }
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_owned(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_owned(),
    })
}

fn parse_preemption(key: &'static str, raw: &str) -> Result<PreemptionMode, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "disabled" => Ok(PreemptionMode::Disabled),
        "mid_batch" => Ok(PreemptionMode::MidBatch),
        "thread_group" => Ok(PreemptionMode::ThreadGroup),
        "mid_thread" => Ok(PreemptionMode::MidThread),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_owned(),
        }),
    }
}

impl SubmitConfig {
    /// Read `GPUSUB_<KEY>` overrides on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`SubmitConfig::from_env`], with variables resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase()));
        let mut cfg = Self::default();

        if let Some(raw) = get("preemption_cmd_sync_programming") {
            cfg.preemption_cmd_sync_programming = parse_bool("preemption_cmd_sync_programming", &raw)?;
        }
        if let Some(raw) = get("direct_submission") {
            cfg.direct_submission = parse_bool("direct_submission", &raw)?;
        }
        if let Some(raw) = get("command_queue_buffer_count") {
            cfg.command_queue_buffer_count = parse_num("command_queue_buffer_count", &raw)?;
        }
        if let Some(raw) = get("command_queue_buffer_size") {
            cfg.command_queue_buffer_size = parse_num("command_queue_buffer_size", &raw)?;
        }
        if let Some(raw) = get("command_list_buffer_size") {
            cfg.command_list_buffer_size = parse_num("command_list_buffer_size", &raw)?;
        }
        if let Some(raw) = get("heap_size") {
            cfg.heap_size = parse_num("heap_size", &raw)?;
        }
        if let Some(raw) = get("force_preemption_mode") {
            cfg.force_preemption_mode = Some(parse_preemption("force_preemption_mode", &raw)?);
        }
        if let Some(raw) = get("noop_memory_prefetch") {
            cfg.noop_memory_prefetch = parse_bool("noop_memory_prefetch", &raw)?;
        }
        if let Some(raw) = get("sync_buffer_size") {
            cfg.sync_buffer_size = parse_num("sync_buffer_size", &raw)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=3).contains(&self.command_queue_buffer_count) {
            return Err(ConfigError::BufferCount(self.command_queue_buffer_count));
        }
        if self.command_queue_buffer_size == 0 {
            return Err(ConfigError::ZeroSize("command_queue_buffer_size"));
        }
        if self.command_list_buffer_size == 0 {
            return Err(ConfigError::ZeroSize("command_list_buffer_size"));
        }
        if self.heap_size == 0 {
            return Err(ConfigError::ZeroSize("heap_size"));
        }
        if self.sync_buffer_size == 0 {
            return Err(ConfigError::ZeroSize("sync_buffer_size"));
        }
        Ok(())
    }
}
