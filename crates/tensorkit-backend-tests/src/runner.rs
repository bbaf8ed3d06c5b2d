//! Runs the suite across a matrix and compares outcomes between configurations.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use tensorkit::tensor::DType;
use tensorkit::{ErrorKind, HostTensor, JitPolicy, Runtime};

use crate::matrix::{Combination, HarnessMatrix};
use crate::suite::{self, SuiteCase};

/// Absolute and relative tolerance for float outputs.
pub const FLOAT_TOLERANCE: f64 = 1e-5;

/// What a suite case produced under one combination.
#[derive(Debug, Clone)]
pub enum Outcome {
    Passed(Vec<HostTensor>),
    Failed { kind: ErrorKind, message: String },
}

impl Outcome {
    pub fn from_result(result: tensorkit::Result<Vec<HostTensor>>) -> Self {
        match result {
            Ok(outputs) => Outcome::Passed(outputs),
            Err(err) => Outcome::Failed {
                kind: err.kind(),
                message: err.to_string(),
            },
        }
    }

    pub fn outputs(&self) -> Option<&[HostTensor]> {
        match self {
            Outcome::Passed(outputs) => Some(outputs),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Passed(_) => None,
            Outcome::Failed { kind, .. } => Some(*kind),
        }
    }

    fn describe(&self) -> String {
        match self {
            Outcome::Passed(outputs) => format!("passed with {} output(s)", outputs.len()),
            Outcome::Failed { kind, message } => format!("failed ({kind:?}): {message}"),
        }
    }
}

/// One case executed under one combination.
#[derive(Debug, Clone)]
pub struct CaseRun {
    pub combination: Combination,
    pub case: &'static str,
    pub mode_specific: bool,
    pub outcome: Outcome,
    /// Result of the case's own expectation check.
    pub check: Result<(), String>,
}

fn run_on(runtime: &Runtime, combination: &Combination, case: &SuiteCase) -> CaseRun {
    let outcome = Outcome::from_result((case.run)(runtime));
    let check = (case.check)(combination, &outcome);
    tracing::debug!(
        case = case.name,
        combination = %combination,
        outcome = %outcome.describe(),
        "suite case finished"
    );
    CaseRun {
        combination: combination.clone(),
        case: case.name,
        mode_specific: case.mode_specific,
        outcome,
        check,
    }
}

/// Runs `cases` on one fresh runtime built for `combination`.
pub fn run_combination(combination: &Combination, cases: &[SuiteCase]) -> Result<Vec<CaseRun>> {
    let runtime = Runtime::new(combination.config())
        .with_context(|| format!("failed to create runtime for {combination}"))?;
    Ok(cases
        .iter()
        .map(|case| run_on(&runtime, combination, case))
        .collect())
}

/// Runs the whole suite under every combination of `matrix`.
pub fn run_matrix(matrix: &HarnessMatrix) -> Result<MatrixReport> {
    let mut runs = Vec::new();
    for combination in matrix.combinations()? {
        runs.extend(run_combination(&combination, suite::cases())?);
    }
    Ok(MatrixReport { runs })
}

#[derive(Debug, Clone, Default)]
pub struct MatrixReport {
    pub runs: Vec<CaseRun>,
}

impl MatrixReport {
    /// Descriptions of runs whose own expectation check failed.
    pub fn failed_checks(&self) -> Vec<String> {
        self.runs
            .iter()
            .filter_map(|run| {
                run.check
                    .as_ref()
                    .err()
                    .map(|err| format!("{} under {}: {err}", run.case, run.combination))
            })
            .collect()
    }

    /// Checks that, per backend, every non-mode-specific case has the same outcome kind and
    /// numerically equal outputs across JIT modes and validation flags.
    pub fn check_equivalence(&self) -> Result<()> {
        let mut groups: BTreeMap<(&str, &str), Vec<&CaseRun>> = BTreeMap::new();
        for run in self.runs.iter().filter(|run| !run.mode_specific) {
            groups
                .entry((run.combination.backend.as_str(), run.case))
                .or_default()
                .push(run);
        }

        let mut mismatches = Vec::new();
        for ((backend, case), runs) in &groups {
            let Some((reference, rest)) = runs.split_first() else {
                continue;
            };
            for other in rest {
                if let Err(err) = outcomes_match(&reference.outcome, &other.outcome) {
                    mismatches.push(format!(
                        "{backend}/{case}: {} vs {}: {err}",
                        reference.combination, other.combination
                    ));
                }
            }
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            bail!(
                "{} equivalence mismatch(es):\n{}",
                mismatches.len(),
                mismatches.join("\n")
            )
        }
    }

    /// Fails on any expectation failure or equivalence mismatch.
    pub fn assert_consistent(&self) -> Result<()> {
        let failed = self.failed_checks();
        if !failed.is_empty() {
            bail!("{} case check(s) failed:\n{}", failed.len(), failed.join("\n"));
        }
        self.check_equivalence()
    }
}

/// Same outcome kind; for passing outcomes, matching outputs.
pub fn outcomes_match(lhs: &Outcome, rhs: &Outcome) -> Result<(), String> {
    match (lhs, rhs) {
        (Outcome::Passed(a), Outcome::Passed(b)) => outputs_match(a, b),
        (Outcome::Failed { kind: a, .. }, Outcome::Failed { kind: b, .. }) if a == b => Ok(()),
        _ => Err(format!("{} vs {}", lhs.describe(), rhs.describe())),
    }
}

/// Exact for integer and bool tensors, within [`FLOAT_TOLERANCE`] for floats.
pub fn outputs_match(lhs: &[HostTensor], rhs: &[HostTensor]) -> Result<(), String> {
    if lhs.len() != rhs.len() {
        return Err(format!("{} outputs vs {}", lhs.len(), rhs.len()));
    }
    for (idx, (a, b)) in lhs.iter().zip(rhs.iter()).enumerate() {
        if a.spec() != b.spec() {
            return Err(format!("output {idx}: spec {} vs {}", a.spec(), b.spec()));
        }
        if !matches!(a.dtype(), DType::F32 | DType::F64) {
            if a.to_literal().bytes != b.to_literal().bytes {
                return Err(format!("output {idx}: values differ"));
            }
            continue;
        }
        for (pos, (x, y)) in a.to_f64_vec().into_iter().zip(b.to_f64_vec()).enumerate() {
            let same = (x.is_nan() && y.is_nan())
                || x == y
                || (x - y).abs() <= FLOAT_TOLERANCE + FLOAT_TOLERANCE * y.abs();
            if !same {
                return Err(format!("output {idx}[{pos}]: {x} vs {y}"));
            }
        }
    }
    Ok(())
}

/// Runs one named case under one combination, applies its check, and (unless the case is
/// mode-specific) compares it with the eager, unvalidated run on the same backend.
pub fn check_case(backend: &str, case_name: &str, jit: JitPolicy, validate: bool) -> Result<()> {
    let case = suite::case(case_name).ok_or_else(|| anyhow!("unknown suite case '{case_name}'"))?;
    let combination = Combination::new(backend, jit, validate);
    let runtime = Runtime::new(combination.config())?;
    let run = run_on(&runtime, &combination, case);
    run.check
        .clone()
        .map_err(|err| anyhow!("{case_name} under {combination}: {err}"))?;
    if case.mode_specific {
        return Ok(());
    }

    let baseline = Combination::new(backend, JitPolicy::ForceEager, false);
    if baseline == combination {
        return Ok(());
    }
    let reference = run_on(&Runtime::new(baseline.config())?, &baseline, case);
    outcomes_match(&reference.outcome, &run.outcome)
        .map_err(|err| anyhow!("{case_name}: {baseline} vs {combination}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: Vec<f32>) -> HostTensor {
        let len = values.len();
        HostTensor::from_vec([len], values).unwrap()
    }

    #[test]
    fn float_outputs_match_within_tolerance() {
        let a = vec![floats(vec![1.0, 2.0])];
        let b = vec![floats(vec![1.000_001, 2.0])];
        assert!(outputs_match(&a, &b).is_ok());
        let c = vec![floats(vec![1.1, 2.0])];
        assert!(outputs_match(&a, &c).is_err());
    }

    #[test]
    fn integer_outputs_must_be_exact() {
        let a = vec![HostTensor::from_vec([2], vec![1i32, 2]).unwrap()];
        let b = vec![HostTensor::from_vec([2], vec![1i32, 3]).unwrap()];
        assert!(outputs_match(&a, &b).is_err());
    }

    #[test]
    fn failure_kinds_are_compared() {
        let shape = Outcome::Failed {
            kind: ErrorKind::Shape,
            message: "a".into(),
        };
        let shape_again = Outcome::Failed {
            kind: ErrorKind::Shape,
            message: "b".into(),
        };
        let trace = Outcome::Failed {
            kind: ErrorKind::Trace,
            message: "c".into(),
        };
        assert!(outcomes_match(&shape, &shape_again).is_ok());
        assert!(outcomes_match(&shape, &trace).is_err());
        assert!(outcomes_match(&shape, &Outcome::Passed(Vec::new())).is_err());
    }
}
