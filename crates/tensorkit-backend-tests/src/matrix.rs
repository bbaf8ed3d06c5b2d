//! The backend x JIT mode x validation configuration matrix.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tensorkit::env::{BACKEND_VAR, JIT_MODE_VAR, VALIDATE_VAR};
use tensorkit::{JitPolicy, RuntimeConfig};

/// Declarative matrix, serialized as `{"backends": [..], "jit": ["all", "none"], "validate": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessMatrix {
    pub backends: Vec<String>,
    pub jit: Vec<String>,
    pub validate: Vec<bool>,
}

impl HarnessMatrix {
    /// `{cpu, faer} x {all, none} x {true, false}`.
    pub fn ci_default() -> Self {
        Self {
            backends: vec!["cpu".to_string(), "faer".to_string()],
            jit: vec!["all".to_string(), "none".to_string()],
            validate: vec![true, false],
        }
    }

    pub fn from_json(src: &str) -> Result<Self> {
        let matrix: HarnessMatrix =
            serde_json::from_str(src).context("failed to parse test matrix")?;
        matrix.check()?;
        Ok(matrix)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let src = fs::read_to_string(path)
            .with_context(|| format!("failed to read test matrix {}", path.display()))?;
        Self::from_json(&src)
    }

    fn check(&self) -> Result<()> {
        if self.backends.is_empty() || self.jit.is_empty() || self.validate.is_empty() {
            bail!("test matrix axes must not be empty");
        }
        for value in &self.jit {
            JitPolicy::parse(value)?;
        }
        Ok(())
    }

    /// Every combination in backend-major order.
    pub fn combinations(&self) -> Result<Vec<Combination>> {
        let mut combos = Vec::new();
        for backend in &self.backends {
            for jit in &self.jit {
                let jit = JitPolicy::parse(jit)?;
                for &validate in &self.validate {
                    combos.push(Combination {
                        backend: backend.clone(),
                        jit,
                        validate,
                    });
                }
            }
        }
        Ok(combos)
    }
}

/// One point of the matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Combination {
    pub backend: String,
    pub jit: JitPolicy,
    pub validate: bool,
}

impl Combination {
    pub fn new(backend: impl Into<String>, jit: JitPolicy, validate: bool) -> Self {
        Self {
            backend: backend.into(),
            jit,
            validate,
        }
    }

    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig::new(self.backend.clone())
            .with_jit(self.jit)
            .with_validation(self.validate)
    }

    /// The `TENSORKIT_*` assignments that select this combination.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![(BACKEND_VAR, self.backend.clone())];
        if let Some(jit) = self.jit.env_value() {
            vars.push((JIT_MODE_VAR, jit.to_string()));
        }
        vars.push((VALIDATE_VAR, self.validate.to_string()));
        vars
    }

    /// Whether compiled regions run traced under this combination.
    pub fn compiles(&self) -> bool {
        self.jit == JitPolicy::ForceCompiled
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/jit={}/validate={}",
            self.backend, self.jit, self.validate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ci_default_has_eight_combinations() {
        let combos = HarnessMatrix::ci_default().combinations().unwrap();
        assert_eq!(combos.len(), 8);
        assert_eq!(combos[0], Combination::new("cpu", JitPolicy::ForceCompiled, true));
        assert_eq!(
            combos[7],
            Combination::new("faer", JitPolicy::ForceEager, false)
        );
    }

    #[test]
    fn checked_in_matrix_matches_default() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../ci/test-matrix.json");
        assert_eq!(HarnessMatrix::load(path).unwrap(), HarnessMatrix::ci_default());
    }

    #[test]
    fn rejects_unknown_jit_mode() {
        let err = HarnessMatrix::from_json(
            r#"{"backends": ["cpu"], "jit": ["sometimes"], "validate": [false]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn env_vars_render_policy() {
        let combo = Combination::new("faer", JitPolicy::ForceEager, true);
        assert_eq!(
            combo.env_vars(),
            vec![
                (BACKEND_VAR, "faer".to_string()),
                (JIT_MODE_VAR, "none".to_string()),
                (VALIDATE_VAR, "true".to_string()),
            ]
        );
        let parsed = RuntimeConfig::from_lookup(|name| {
            combo
                .env_vars()
                .into_iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| value)
        })
        .unwrap();
        assert_eq!(parsed, combo.config());
    }
}
