//! The shared backend suite.
//!
//! Every case builds its own compiled regions, calls them through the runtime and returns
//! host copies of the outputs. Cases marked `mode_specific` legitimately behave differently
//! across JIT modes or validation flags; their `check` encodes the expected difference.

use tensorkit::distributions::Uniform;
use tensorkit::ops::{concat, matmul, where_};
use tensorkit::tensor::DType;
use tensorkit::{CompiledRegion, ErrorKind, HostTensor, Result, Runtime, Shape, Tensor, TensorSpec};

use crate::matrix::Combination;
use crate::runner::Outcome;

pub type CaseFn = fn(&Runtime) -> Result<Vec<HostTensor>>;
pub type CheckFn = fn(&Combination, &Outcome) -> std::result::Result<(), String>;

pub struct SuiteCase {
    pub name: &'static str,
    pub mode_specific: bool,
    pub run: CaseFn,
    pub check: CheckFn,
}

const fn shared(name: &'static str, run: CaseFn, check: CheckFn) -> SuiteCase {
    SuiteCase {
        name,
        mode_specific: false,
        run,
        check,
    }
}

const fn mode_specific(name: &'static str, run: CaseFn, check: CheckFn) -> SuiteCase {
    SuiteCase {
        name,
        mode_specific: true,
        run,
        check,
    }
}

static CASES: &[SuiteCase] = &[
    shared("broadcast_add", broadcast_add, check_broadcast_add),
    shared("unary_chain", unary_chain, expect_pass),
    shared("binary_promotion", binary_promotion, check_binary_promotion),
    shared("comparisons_and_logic", comparisons_and_logic, check_comparisons_and_logic),
    shared("reductions", reductions, check_reductions),
    shared("matmul_batched", matmul_batched, check_matmul_batched),
    shared("shape_manipulation", shape_manipulation, check_shape_manipulation),
    shared("seeded_random", seeded_random, expect_pass),
    shared("value_and_grad", value_and_grad, check_value_and_grad),
    shared("uniform_distribution", uniform_distribution, check_uniform_distribution),
    shared("uniform_tensor_bounds", uniform_tensor_bounds, check_uniform_tensor_bounds),
    shared("in_place_updates", in_place_updates, check_in_place_updates),
    shared("nested_regions", nested_regions, check_nested_regions),
    shared("shape_mismatch", shape_mismatch, expect_shape_error),
    shared("integer_divide_by_zero", integer_divide_by_zero, expect_backend_error),
    mode_specific("non_finite_output", non_finite_output, check_non_finite_output),
    mode_specific("data_dependent_branch", data_dependent_branch, check_data_dependent_branch),
];

pub fn cases() -> &'static [SuiteCase] {
    CASES
}

pub fn case_names() -> impl Iterator<Item = &'static str> {
    CASES.iter().map(|case| case.name)
}

pub fn case(name: &str) -> Option<&'static SuiteCase> {
    CASES.iter().find(|case| case.name == name)
}

fn hosts(outputs: Vec<Tensor>) -> Result<Vec<HostTensor>> {
    outputs.iter().map(Tensor::to_host).collect()
}

fn float_spec(runtime: &Runtime, dims: impl Into<Shape>) -> TensorSpec {
    TensorSpec::new(runtime.float_x(), dims)
}

fn passed(outcome: &Outcome) -> std::result::Result<&[HostTensor], String> {
    match outcome {
        Outcome::Passed(outputs) => Ok(outputs),
        Outcome::Failed { kind, message } => {
            Err(format!("expected success, got {kind:?}: {message}"))
        }
    }
}

/// Passed outputs, which must number exactly `arity`.
fn outputs(outcome: &Outcome, arity: usize) -> std::result::Result<&[HostTensor], String> {
    let outputs = passed(outcome)?;
    if outputs.len() == arity {
        Ok(outputs)
    } else {
        Err(format!("expected {arity} output(s), got {}", outputs.len()))
    }
}

fn expect_values(output: &HostTensor, expected: &[f64]) -> std::result::Result<(), String> {
    let actual = output.to_f64_vec();
    let close = actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected)
            .all(|(a, e)| (a - e).abs() <= 1e-4 * (1.0 + e.abs()));
    if close {
        Ok(())
    } else {
        Err(format!("expected {expected:?}, got {actual:?}"))
    }
}

fn expect_pass(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    passed(outcome).map(|_| ())
}

fn expect_error(outcome: &Outcome, expected: ErrorKind) -> std::result::Result<(), String> {
    match outcome.error_kind() {
        Some(kind) if kind == expected => Ok(()),
        Some(kind) => Err(format!("expected {expected:?} error, got {kind:?}")),
        None => Err(format!("expected {expected:?} error, got success")),
    }
}

fn expect_shape_error(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    expect_error(outcome, ErrorKind::Shape)
}

fn expect_backend_error(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    expect_error(outcome, ErrorKind::Backend)
}

fn broadcast_add(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("broadcast_add", |xs: &[Tensor]| Ok(vec![xs[0].add(&xs[1])?]));
    let x = runtime.ones(float_spec(runtime, [2, 3]))?;
    let y = runtime.full(float_spec(runtime, [3]), 2.0)?;
    hosts(runtime.call(&region, &[x, y])?)
}

fn check_broadcast_add(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 1)?;
    if outputs[0].shape().dims() != [2, 3] {
        return Err(format!("unexpected shape {}", outputs[0].shape()));
    }
    expect_values(&outputs[0], &[3.0; 6])
}

fn unary_chain(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("unary_chain", |xs: &[Tensor]| {
        let x = &xs[0];
        let smooth = x.exp()?.log1p()?.tanh()?.add(&x.sqrt()?)?;
        let wave = x.square()?.neg()?.abs()?.sin()?.cos()?;
        let signed = x.sub(&x.scalar_like(1.5)?)?.sign()?;
        Ok(vec![smooth.sub(&wave)?, signed, x.log()?])
    });
    let x = runtime.floats([4], vec![0.5, 1.0, 2.0, 3.0])?;
    hosts(runtime.call(&region, &[x])?)
}

fn binary_promotion(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("binary_promotion", |xs: &[Tensor]| {
        let (ints, divisors, scale) = (&xs[0], &xs[1], &xs[2]);
        Ok(vec![
            ints.add(scale)?,
            ints.div(divisors)?,
            ints.floordiv(divisors)?,
            ints.modulo(divisors)?,
            ints.fmod(divisors)?,
            ints.pow(&divisors.abs()?)?,
            ints.maximum(divisors)?,
            ints.minimum(divisors)?,
        ])
    });
    let ints = runtime.tensor([3], vec![7i32, -7, 9])?;
    let divisors = runtime.tensor([3], vec![2i32, 3, -4])?;
    let scale = runtime.full(TensorSpec::new(runtime.float_x(), Shape::scalar()), 0.5)?;
    hosts(runtime.call(&region, &[ints, divisors, scale])?)
}

fn check_binary_promotion(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 8)?;
    if !outputs[0].dtype().is_float() {
        return Err(format!("int + float gave {}", outputs[0].dtype()));
    }
    if outputs[1].dtype() != DType::F64 {
        return Err(format!("integer true division gave {}", outputs[1].dtype()));
    }
    if outputs[2..].iter().any(|output| output.dtype() != DType::I32) {
        return Err("integer arithmetic left int32".into());
    }
    expect_values(&outputs[1], &[3.5, -7.0 / 3.0, -2.25])?;
    expect_values(&outputs[2], &[3.0, -3.0, -3.0])?;
    expect_values(&outputs[3], &[1.0, 2.0, -3.0])?;
    expect_values(&outputs[4], &[1.0, -1.0, 1.0])?;
    expect_values(&outputs[5], &[49.0, -343.0, 6561.0])
}

fn comparisons_and_logic(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("comparisons_and_logic", |xs: &[Tensor]| {
        let (a, b) = (&xs[0], &xs[1]);
        let lt = a.less(b)?;
        let ge = a.greater_equal(b)?;
        let eq = a.equal(b)?;
        let picked = where_(&lt, a, b)?;
        Ok(vec![
            lt.logical_and(&eq.logical_not()?)?,
            lt.logical_or(&eq)?,
            ge.logical_xor(&eq)?,
            a.not_equal(b)?,
            a.less_equal(b)?.logical_and(&a.greater(b)?)?,
            picked,
        ])
    });
    let a = runtime.floats([4], vec![1.0, 2.0, 3.0, 4.0])?;
    let b = runtime.floats([4], vec![4.0, 2.0, 1.0, 5.0])?;
    hosts(runtime.call(&region, &[a, b])?)
}

fn check_comparisons_and_logic(
    _: &Combination,
    outcome: &Outcome,
) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 6)?;
    if outputs[0].to_vec::<bool>().map_err(|e| e.to_string())? != [true, false, false, true] {
        return Err("logical_and mismatch".into());
    }
    expect_values(&outputs[5], &[1.0, 2.0, 1.0, 4.0])
}

fn reductions(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("reductions", |xs: &[Tensor]| {
        let x = &xs[0];
        let positive = x.greater(&x.scalar_like(0.0)?)?;
        Ok(vec![
            x.reduce_sum(&[-1], false)?,
            x.reduce_mean(&[0, 2], true)?,
            x.reduce_max(&[], false)?,
            x.reduce_min(&[1], false)?,
            x.reduce_prod(&[2], false)?,
            positive.reduce_all(&[], false)?,
            positive.reduce_any(&[0], false)?,
        ])
    });
    let values: Vec<f64> = (1..=24).map(f64::from).collect();
    let x = runtime.floats([2, 3, 4], values)?;
    hosts(runtime.call(&region, &[x])?)
}

fn check_reductions(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 7)?;
    expect_values(&outputs[0], &[10.0, 26.0, 42.0, 58.0, 74.0, 90.0])?;
    if outputs[1].shape().dims() != [1, 3, 1] {
        return Err(format!("keepdims shape {}", outputs[1].shape()));
    }
    expect_values(&outputs[1], &[8.5, 12.5, 16.5])?;
    expect_values(&outputs[2], &[24.0])?;
    expect_values(&outputs[3], &[1.0, 2.0, 3.0, 4.0, 13.0, 14.0, 15.0, 16.0])
}

fn matmul_batched(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("matmul_batched", |xs: &[Tensor]| {
        let batched = matmul(&xs[0], &xs[1])?;
        let lhs = xs[0].slice(&[0, 0, 0], &[1, 3, 4])?.squeeze(&[0])?;
        let rhs = xs[1].slice(&[1, 0, 0], &[1, 4, 5])?.squeeze(&[0])?;
        Ok(vec![batched, lhs.matmul(&rhs)?])
    });
    let lhs: Vec<f64> = (0..24).map(|v| f64::from(v) * 0.25).collect();
    let rhs: Vec<f64> = (0..40).map(|v| 1.0 - f64::from(v) * 0.05).collect();
    let a = runtime.floats([2, 3, 4], lhs)?;
    let b = runtime.floats([2, 4, 5], rhs)?;
    hosts(runtime.call(&region, &[a, b])?)
}

fn check_matmul_batched(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 2)?;
    if outputs[0].shape().dims() != [2, 3, 5] || outputs[1].shape().dims() != [3, 5] {
        return Err(format!(
            "unexpected shapes {} and {}",
            outputs[0].shape(),
            outputs[1].shape()
        ));
    }
    // row 0 of lhs batch 0 is [0, .25, .5, .75]; column 0 of rhs batch 1 is [0, -.25, -.5, -.75]
    match outputs[1].to_f64_vec().first() {
        Some(corner) if (corner + 0.875).abs() <= 1e-5 => Ok(()),
        corner => Err(format!("expected -0.875 at [0, 0], got {corner:?}")),
    }
}

fn shape_manipulation(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("shape_manipulation", |xs: &[Tensor]| {
        let x = &xs[0];
        let flat = x.reshape(&[-1, 6])?;
        let swapped = x.transpose(None)?;
        let joined = concat(&[x.clone(), x.mul_scalar(2.0)?], 0)?;
        let window = joined.slice(&[1, 1], &[2, 2])?;
        let lifted = x.expand_dims(0)?.broadcast_to([2, 2, 3])?;
        let ints = x.cast(DType::I32)?;
        Ok(vec![flat, swapped, joined, window, lifted, ints])
    });
    let x = runtime.floats([2, 3], vec![0.5, 1.5, 2.5, 3.5, 4.5, 5.5])?;
    hosts(runtime.call(&region, &[x])?)
}

fn check_shape_manipulation(
    _: &Combination,
    outcome: &Outcome,
) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 6)?;
    expect_values(&outputs[1], &[0.5, 3.5, 1.5, 4.5, 2.5, 5.5])?;
    expect_values(&outputs[3], &[4.5, 5.5, 3.0, 5.0])?;
    if outputs[4].shape().dims() != [2, 2, 3] {
        return Err(format!("broadcast shape {}", outputs[4].shape()));
    }
    expect_values(&outputs[5], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
}

fn seeded_random(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("seeded_random", |xs: &[Tensor]| {
        let runtime = xs[0].runtime();
        let noise = runtime.randn(xs[0].shape().clone(), None, 17)?;
        let unit = runtime.rand([3], None, 5)?;
        let ranged = runtime.uniform([3], -2.0, 2.0, None, 9)?;
        Ok(vec![xs[0].add(&noise)?, unit, ranged])
    });
    let x = runtime.zeros(float_spec(runtime, [2, 2]))?;
    hosts(runtime.call(&region, &[x])?)
}

fn value_and_grad(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("weighted_square_loss", |xs: &[Tensor]| {
        let (x, w) = (&xs[0], &xs[1]);
        let y = x.matmul(w)?.tanh()?;
        let loss = y.square()?.reduce_sum(&[], false)?;
        let penalty = w.exp()?.reduce_mean(&[], false)?;
        Ok(vec![loss.add(&penalty)?])
    });
    let x = runtime.floats([2, 3], vec![0.1, -0.2, 0.3, 0.4, 0.5, -0.6])?;
    let w = runtime.floats([3, 1], vec![0.7, -0.8, 0.9])?;
    let (value, grads) = runtime.value_and_grad(&region, &[x.clone(), w])?;

    let squares = CompiledRegion::new("sum_of_squares", |xs: &[Tensor]| {
        Ok(vec![xs[0].mul(&xs[0])?.reduce_sum(&[], false)?])
    });
    let (_, square_grads) = runtime.value_and_grad(&squares, &[x])?;

    let mut outputs = vec![value];
    outputs.extend(grads);
    outputs.extend(square_grads);
    hosts(outputs)
}

fn check_value_and_grad(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 4)?;
    if outputs[1].shape().dims() != [2, 3]
        || outputs[2].shape().dims() != [3, 1]
    {
        return Err("unexpected gradient shapes".into());
    }
    expect_values(&outputs[3], &[0.2, -0.4, 0.6, 0.8, 1.0, -1.2])
}

fn uniform_distribution(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("uniform_log_prob", |xs: &[Tensor]| {
        let uniform = Uniform::from_floats(xs[0].runtime(), -1.0, 2.0)?;
        let samples = uniform.sample(Some(4), 3)?;
        Ok(vec![uniform.log_prob(&xs[0])?, samples])
    });
    let given = runtime.floats([4], vec![-2.0, 0.0, 1.5, 3.0])?;
    hosts(runtime.call(&region, &[given])?)
}

fn check_uniform_distribution(
    _: &Combination,
    outcome: &Outcome,
) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 2)?;
    let inside = -(3.0f64.ln());
    expect_values(&outputs[0], &[-1e7, inside, inside, -1e7])?;
    if outputs[1]
        .to_f64_vec()
        .iter()
        .any(|v| !(-1.0..2.0).contains(v))
    {
        return Err("sample outside [-1, 2)".into());
    }
    Ok(())
}

fn uniform_tensor_bounds(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("uniform_tensor_bounds", |xs: &[Tensor]| {
        let uniform = Uniform::new(&xs[0], &xs[1])?;
        let samples = uniform.sample(Some(3), 21)?;
        Ok(vec![samples.clone(), uniform.log_prob(&samples)?])
    });
    let low = runtime.floats([2], vec![0.0, -1.0])?;
    let high = runtime.floats([2], vec![1.0, 3.0])?;
    hosts(runtime.call(&region, &[low, high])?)
}

fn check_uniform_tensor_bounds(
    _: &Combination,
    outcome: &Outcome,
) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 2)?;
    if outputs[0].shape().dims() != [3, 2] {
        return Err(format!("unexpected sample shape {}", outputs[0].shape()));
    }
    let samples = outputs[0].to_f64_vec();
    let in_bounds = samples
        .chunks_exact(2)
        .all(|row| (0.0..=1.0).contains(&row[0]) && (-1.0..=3.0).contains(&row[1]));
    if !in_bounds {
        return Err(format!("samples outside their bounds: {samples:?}"));
    }
    let wide = -(4.0f64.ln());
    expect_values(&outputs[1], &[0.0, wide, 0.0, wide, 0.0, wide])
}

fn in_place_updates(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("in_place_updates", |xs: &[Tensor]| {
        let mut acc = xs[0].clone();
        acc.add_(&xs[1])?;
        acc.mul_(&xs[1])?;
        acc.sub_(&xs[0])?;
        acc.div_(&xs[1])?;
        Ok(vec![acc])
    });
    let x = runtime.floats([3], vec![1.0, 2.0, 3.0])?;
    let y = runtime.floats([3], vec![2.0, 4.0, 8.0])?;
    hosts(runtime.call(&region, &[x, y])?)
}

fn check_in_place_updates(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    let outputs = outputs(outcome, 1)?;
    // ((x + y) * y - x) / y
    expect_values(&outputs[0], &[2.5, 5.5, 10.625])
}

fn nested_regions(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let outer = CompiledRegion::new("nested_outer", |xs: &[Tensor]| {
        let inner = CompiledRegion::new("nested_inner", |xs: &[Tensor]| {
            Ok(vec![xs[0].mul_scalar(3.0)?])
        });
        let tripled = xs[0].runtime().call(&inner, xs)?;
        Ok(vec![tripled[0].add_scalar(1.0)?])
    });
    let x = runtime.floats([2], vec![1.0, -1.0])?;
    hosts(runtime.call(&outer, &[x])?)
}

fn check_nested_regions(_: &Combination, outcome: &Outcome) -> std::result::Result<(), String> {
    expect_values(&outputs(outcome, 1)?[0], &[4.0, -2.0])
}

fn shape_mismatch(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("shape_mismatch", |xs: &[Tensor]| Ok(vec![xs[0].add(&xs[1])?]));
    let x = runtime.ones(float_spec(runtime, [2, 3]))?;
    let y = runtime.ones(float_spec(runtime, [4]))?;
    hosts(runtime.call(&region, &[x, y])?)
}

fn integer_divide_by_zero(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("integer_divide_by_zero", |xs: &[Tensor]| {
        Ok(vec![xs[0].floordiv(&xs[1])?])
    });
    let x = runtime.tensor([2], vec![4i64, 5])?;
    let y = runtime.tensor([2], vec![2i64, 0])?;
    hosts(runtime.call(&region, &[x, y])?)
}

fn non_finite_output(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("non_finite_output", |xs: &[Tensor]| {
        Ok(vec![xs[0].log()?.add_scalar(1.0)?])
    });
    let x = runtime.floats([3], vec![1.0, 0.0, 2.0])?;
    hosts(runtime.call(&region, &[x])?)
}

fn check_non_finite_output(
    combination: &Combination,
    outcome: &Outcome,
) -> std::result::Result<(), String> {
    if combination.validate {
        match outcome {
            Outcome::Failed {
                kind: ErrorKind::NumericValidation,
                message,
            } if message.contains("log") && message.contains("1 non-finite") => Ok(()),
            other => Err(format!("expected a validation error from log, got {other:?}")),
        }
    } else {
        let values = outputs(outcome, 1)?[0].to_f64_vec();
        match values.as_slice() {
            [first, second, _] if *first == 1.0 && *second == f64::NEG_INFINITY => Ok(()),
            _ => Err(format!("expected -inf to pass through, got {values:?}")),
        }
    }
}

fn data_dependent_branch(runtime: &Runtime) -> Result<Vec<HostTensor>> {
    let region = CompiledRegion::new("data_dependent_branch", |xs: &[Tensor]| {
        let total = xs[0].reduce_sum(&[], false)?;
        if total.item()? > 0.0 {
            Ok(vec![xs[0].add_scalar(1.0)?])
        } else {
            Ok(vec![xs[0].neg()?])
        }
    });
    let x = runtime.floats([2], vec![1.0, 2.0])?;
    hosts(runtime.call(&region, &[x])?)
}

fn check_data_dependent_branch(
    combination: &Combination,
    outcome: &Outcome,
) -> std::result::Result<(), String> {
    if combination.compiles() {
        expect_error(outcome, ErrorKind::Trace)
    } else {
        expect_values(&outputs(outcome, 1)?[0], &[2.0, 3.0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tensorkit::JitPolicy;

    #[test]
    fn case_names_are_unique() {
        let names: HashSet<_> = case_names().collect();
        assert_eq!(names.len(), cases().len());
    }

    #[test]
    fn checks_reject_missing_outputs() {
        let combination = Combination::new("cpu", JitPolicy::ForceEager, false);
        let empty = Outcome::Passed(Vec::new());
        for case in cases() {
            let verdict = (case.check)(&combination, &empty);
            match case.name {
                "unary_chain" | "seeded_random" => assert!(verdict.is_ok(), "{}", case.name),
                _ => assert!(verdict.is_err(), "{} accepted no outputs", case.name),
            }
        }
    }

    #[test]
    fn lookup_by_name() {
        assert!(case("broadcast_add").is_some());
        assert!(case("missing").is_none());
        assert!(case("data_dependent_branch").unwrap().mode_specific);
    }
}
