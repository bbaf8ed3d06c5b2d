use std::path::Path;

use anyhow::Result;
use tensorkit_backend_tests::matrix::HarnessMatrix;
use tensorkit_backend_tests::runner::run_matrix;

fn register_backends() {
    tensorkit_backend_ref_cpu::register_cpu_backend();
    tensorkit_backend_faer::register_faer_backend();
}

#[test]
fn checked_in_matrix_is_consistent() -> Result<()> {
    register_backends();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../ci/test-matrix.json");
    let report = run_matrix(&HarnessMatrix::load(path)?)?;
    assert_eq!(report.runs.len(), 8 * tensorkit_backend_tests::suite::cases().len());
    report.assert_consistent()
}

#[test]
fn backends_agree_with_each_other() -> Result<()> {
    register_backends();
    let matrix = HarnessMatrix::ci_default();
    let report = run_matrix(&matrix)?;
    for run in report.runs.iter().filter(|run| run.combination.backend == "faer") {
        if run.mode_specific {
            continue;
        }
        let reference = report
            .runs
            .iter()
            .find(|other| {
                other.case == run.case
                    && other.combination.backend == "cpu"
                    && other.combination.jit == run.combination.jit
                    && other.combination.validate == run.combination.validate
            })
            .expect("cpu run for every faer run");
        if let Err(err) =
            tensorkit_backend_tests::runner::outcomes_match(&reference.outcome, &run.outcome)
        {
            panic!("{} under {}: {err}", run.case, run.combination);
        }
    }
    Ok(())
}
