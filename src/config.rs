use benchkeeper_protocol::{EngineError, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const ENV_PARALLEL: &str = "BENCHKEEPER_PARALLEL";
pub const ENV_KEEP_ALL: &str = "BENCHKEEPER_KEEP_ALL";
pub const ENV_DATASET_POLICY: &str = "BENCHKEEPER_DATASET_POLICY";

/// What to do when the supplied dataset digest differs from the recorded one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatasetPolicy {
    #[default]
    Warn,
    Recompute,
    Refuse,
}

impl DatasetPolicy {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "warn" => Some(Self::Warn),
            "recompute" => Some(Self::Recompute),
            "refuse" => Some(Self::Refuse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BenchParameters {
    pub keep_all: bool,
    pub dataset_policy: DatasetPolicy,
    pub parallel: bool,
    pub keep_raw_output: bool,
    pub keep_dataset: bool,
    /// Free-form key/values copied into every session's environment record.
    pub environment_tags: BTreeMap<String, String>,
}

impl Default for BenchParameters {
    fn default() -> Self {
        Self {
            keep_all: true,
            dataset_policy: DatasetPolicy::Warn,
            parallel: false,
            keep_raw_output: true,
            keep_dataset: false,
            environment_tags: BTreeMap::new(),
        }
    }
}

fn normalized_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok().and_then(|v| normalized_non_empty(&v))?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn bool_param(name: &str, value: &Value) -> Result<bool, EngineError> {
    value.as_bool().ok_or_else(|| {
        EngineError::new(
            ErrorCode::InvalidInput,
            format!("Parameter '{name}' requires a boolean"),
        )
    })
}

impl BenchParameters {
    /// Applies `BENCHKEEPER_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_flag(ENV_PARALLEL) {
            self.parallel = v;
        }
        if let Some(v) = env_flag(ENV_KEEP_ALL) {
            self.keep_all = v;
        }
        if let Some(policy) = std::env::var(ENV_DATASET_POLICY)
            .ok()
            .and_then(|v| DatasetPolicy::parse(&v))
        {
            self.dataset_policy = policy;
        }
        self
    }

    pub fn set_parameter(&mut self, name: &str, value: &Value) -> Result<String, EngineError> {
        match name {
            "keep_all" => self.keep_all = bool_param(name, value)?,
            "parallel" => self.parallel = bool_param(name, value)?,
            "keep_raw_output" => self.keep_raw_output = bool_param(name, value)?,
            "keep_dataset" => self.keep_dataset = bool_param(name, value)?,
            "dataset_policy" => {
                self.dataset_policy = value
                    .as_str()
                    .and_then(DatasetPolicy::parse)
                    .ok_or_else(|| {
                        EngineError::new(
                            ErrorCode::InvalidInput,
                            "dataset_policy must be one of 'warn', 'recompute', 'refuse'",
                        )
                    })?;
            }
            "environment_tags" => {
                self.environment_tags = serde_json::from_value(value.clone()).map_err(|e| {
                    EngineError::new(
                        ErrorCode::InvalidInput,
                        format!("environment_tags must be a string map: {e}"),
                    )
                })?;
            }
            _ => {
                return Err(EngineError::new(
                    ErrorCode::NotFound,
                    format!("Unknown parameter '{name}'"),
                ));
            }
        }
        Ok(format!("Set parameter '{name}' to {value}"))
    }
}

/// Per-call switches for `update_bench`. Defaults to a dry run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub dry_run: bool,
    pub keep_all: bool,
    pub dataset_policy: DatasetPolicy,
    pub parallel: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self::from_parameters(&BenchParameters::default())
    }
}

impl UpdateOptions {
    pub fn from_parameters(parameters: &BenchParameters) -> Self {
        Self {
            dry_run: true,
            keep_all: parameters.keep_all,
            dataset_policy: parameters.dataset_policy,
            parallel: parameters.parallel,
        }
    }

    pub fn execute(mut self) -> Self {
        self.dry_run = false;
        self
    }

    pub fn keep_all(mut self, keep_all: bool) -> Self {
        self.keep_all = keep_all;
        self
    }

    pub fn dataset_policy(mut self, policy: DatasetPolicy) -> Self {
        self.dataset_policy = policy;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}
