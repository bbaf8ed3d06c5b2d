//! Process-environment configuration.
//!
//! Values are read exactly once into an immutable [`RuntimeConfig`]; nothing else in the crate
//! consults the environment.

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::spec::DType;
use crate::error::ConfigurationError;

pub const BACKEND_VAR: &str = "TENSORKIT_BACKEND";
pub const JIT_MODE_VAR: &str = "TENSORKIT_JIT_MODE";
pub const VALIDATE_VAR: &str = "TENSORKIT_VALIDATE_TENSORS";
pub const FLOAT_X_VAR: &str = "TENSORKIT_FLOAT_X";

pub const DEFAULT_BACKEND: &str = "cpu";

/// Global JIT policy selected by `TENSORKIT_JIT_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitPolicy {
    /// `all`: every compiled region runs compiled, overrides are ignored.
    ForceCompiled,
    /// `none`: every region runs eagerly.
    ForceEager,
    /// Unset: each region decides.
    #[default]
    PerRegion,
}

impl JitPolicy {
    pub fn parse(value: &str) -> Result<Self, ConfigurationError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(JitPolicy::PerRegion),
            "all" => Ok(JitPolicy::ForceCompiled),
            "none" => Ok(JitPolicy::ForceEager),
            _ => Err(ConfigurationError::InvalidValue {
                variable: JIT_MODE_VAR.to_string(),
                value: value.to_string(),
                expected: "'all', 'none' or unset",
            }),
        }
    }

    /// Value of `TENSORKIT_JIT_MODE` that selects this policy; `None` means unset.
    pub fn env_value(self) -> Option<&'static str> {
        match self {
            JitPolicy::ForceCompiled => Some("all"),
            JitPolicy::ForceEager => Some("none"),
            JitPolicy::PerRegion => None,
        }
    }
}

impl fmt::Display for JitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_value().unwrap_or("per-region"))
    }
}

/// Immutable runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub backend: String,
    pub jit: JitPolicy,
    pub validate_tensors: bool,
    pub float_x: DType,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            jit: JitPolicy::PerRegion,
            validate_tensors: false,
            float_x: DType::F32,
        }
    }
}

impl RuntimeConfig {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    pub fn with_jit(mut self, jit: JitPolicy) -> Self {
        self.jit = jit;
        self
    }

    pub fn with_validation(mut self, validate_tensors: bool) -> Self {
        self.validate_tensors = validate_tensors;
        self
    }

    pub fn with_float_x(mut self, float_x: DType) -> Self {
        self.float_x = float_x;
        self
    }

    /// Reads the `TENSORKIT_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RuntimeConfig::default();

        if let Some(value) = lookup(BACKEND_VAR) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.backend = trimmed.to_string();
            }
        }
        if let Some(value) = lookup(JIT_MODE_VAR) {
            config.jit = JitPolicy::parse(&value)?;
        }
        if let Some(value) = lookup(VALIDATE_VAR) {
            if !value.trim().is_empty() {
                config.validate_tensors = parse_bool(VALIDATE_VAR, &value)?;
            }
        }
        if let Some(value) = lookup(FLOAT_X_VAR) {
            if !value.trim().is_empty() {
                config.float_x = match DType::parse(&value) {
                    Some(dtype) if dtype.is_float() => dtype,
                    _ => {
                        return Err(ConfigurationError::InvalidValue {
                            variable: FLOAT_X_VAR.to_string(),
                            value,
                            expected: "'float32' or 'float64'",
                        })
                    }
                };
            }
        }
        Ok(config)
    }
}

fn parse_bool(variable: &str, value: &str) -> Result<bool, ConfigurationError> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigurationError::InvalidValue {
            variable: variable.to_string(),
            value: value.to_string(),
            expected: "a boolean (true/false, 1/0, yes/no, on/off)",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.backend, "cpu");
        assert_eq!(config.jit, JitPolicy::PerRegion);
        assert!(!config.validate_tensors);
        assert_eq!(config.float_x, DType::F32);
    }

    #[test]
    fn reads_every_variable() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (BACKEND_VAR, "faer"),
            (JIT_MODE_VAR, "ALL"),
            (VALIDATE_VAR, "Yes"),
            (FLOAT_X_VAR, "float64"),
        ]))
        .unwrap();
        assert_eq!(config.backend, "faer");
        assert_eq!(config.jit, JitPolicy::ForceCompiled);
        assert!(config.validate_tensors);
        assert_eq!(config.float_x, DType::F64);
    }

    #[test]
    fn empty_jit_mode_means_per_region() {
        let config = RuntimeConfig::from_lookup(lookup(&[(JIT_MODE_VAR, "")])).unwrap();
        assert_eq!(config.jit, JitPolicy::PerRegion);
        let config = RuntimeConfig::from_lookup(lookup(&[(JIT_MODE_VAR, "none")])).unwrap();
        assert_eq!(config.jit, JitPolicy::ForceEager);
    }

    #[test]
    fn rejects_unknown_jit_mode() {
        let err = RuntimeConfig::from_lookup(lookup(&[(JIT_MODE_VAR, "sometimes")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidValue { ref variable, .. } if variable == JIT_MODE_VAR
        ));
    }

    #[test]
    fn bool_parsing_is_case_insensitive_and_strict() {
        for (raw, expected) in [
            ("true", true),
            ("FALSE", false),
            ("1", true),
            ("0", false),
            ("On", true),
            ("off", false),
        ] {
            assert_eq!(parse_bool(VALIDATE_VAR, raw).unwrap(), expected, "{raw}");
        }
        assert!(parse_bool(VALIDATE_VAR, "maybe").is_err());
    }

    #[test]
    fn rejects_integer_float_x() {
        let err = RuntimeConfig::from_lookup(lookup(&[(FLOAT_X_VAR, "int32")])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }
}
