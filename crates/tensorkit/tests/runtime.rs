use anyhow::Result;
use tensorkit::distributions::Uniform;
use tensorkit::{
    jit, CompiledRegion, ConfigurationError, DType, ErrorKind, ExecutionMode, JitPolicy,
    ModeTransitionError, Runtime, RuntimeConfig, Shape, Tensor, TensorKitError, TensorSpec,
    TraceError,
};

fn runtime(jit: JitPolicy, validate: bool) -> Result<Runtime> {
    tensorkit::logging::init_logging();
    tensorkit_backend_ref_cpu::register_cpu_backend();
    Ok(Runtime::new(
        RuntimeConfig::new("cpu")
            .with_jit(jit)
            .with_validation(validate),
    )?)
}

fn add_region() -> CompiledRegion {
    CompiledRegion::new("add", |xs: &[Tensor]| Ok(vec![xs[0].add(&xs[1])?]))
}

#[test]
fn broadcast_add_agrees_across_modes() -> Result<()> {
    let mut results = Vec::new();
    for policy in [JitPolicy::ForceEager, JitPolicy::ForceCompiled] {
        let rt = runtime(policy, false)?;
        let x = rt.ones(TensorSpec::new(DType::F32, [2, 3]))?;
        let y = rt.full(TensorSpec::new(DType::F32, [3]), 2.0)?;
        let out = rt.call(&add_region(), &[x, y])?.remove(0);
        assert_eq!(out.dims(), &[2, 3]);
        results.push(out.to_vec::<f32>()?);
    }
    assert_eq!(results[0], vec![3.0; 6]);
    assert_eq!(results[0], results[1]);
    Ok(())
}

#[test]
fn validation_reports_single_infinity() -> Result<()> {
    let rt = runtime(JitPolicy::ForceEager, true)?;
    let x = rt.floats([4], vec![1.0, 0.0, 2.0, 3.0])?;
    let y = rt.floats([4], vec![1.0, 1.0, 1.0, 1.0])?;
    let err = y.div(&x).unwrap_err();
    match err {
        TensorKitError::NumericValidation(report) => {
            assert_eq!(report.operation, "div");
            assert_eq!(report.invalid, 1);
            assert_eq!(report.total, 4);
            assert_eq!(report.shape, Shape::new(vec![4]));
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn validation_off_passes_infinity_through() -> Result<()> {
    let rt = runtime(JitPolicy::ForceEager, false)?;
    let x = rt.floats([2], vec![0.0, 2.0])?;
    let y = rt.floats([2], vec![1.0, 1.0])?;
    let out = y.div(&x)?.to_vec::<f32>()?;
    assert_eq!(out, vec![f32::INFINITY, 0.5]);
    Ok(())
}

#[test]
fn validation_checks_compiled_replays() -> Result<()> {
    let rt = runtime(JitPolicy::ForceCompiled, true)?;
    let region = CompiledRegion::new("log", |xs: &[Tensor]| Ok(vec![xs[0].log()?]));
    let x = rt.floats([3], vec![1.0, 0.0, 2.0])?;
    let err = rt.call(&region, &[x]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NumericValidation);
    Ok(())
}

#[test]
fn concrete_value_while_tracing_is_a_trace_error() -> Result<()> {
    let rt = runtime(JitPolicy::ForceCompiled, false)?;
    let region = CompiledRegion::new("branchy", |xs: &[Tensor]| {
        if xs[0].reduce_sum(&[], false)?.item()? > 0.0 {
            Ok(vec![xs[0].clone()])
        } else {
            Ok(vec![xs[0].neg()?])
        }
    });
    let x = rt.floats([2], vec![1.0, 2.0])?;
    let err = rt.call(&region, &[x.clone()]).unwrap_err();
    assert!(matches!(
        err,
        TensorKitError::Trace(TraceError::ConcretizationRequired { .. })
    ));

    let eager = runtime(JitPolicy::ForceEager, false)?;
    let x = eager.floats([2], vec![1.0, 2.0])?;
    assert_eq!(eager.call(&region, &[x])?[0].to_vec::<f32>()?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn traces_once_per_signature() -> Result<()> {
    let rt = runtime(JitPolicy::ForceCompiled, false)?;
    let region = add_region();
    for _ in 0..3 {
        let x = rt.ones(TensorSpec::new(DType::F32, [2]))?;
        rt.call(&region, &[x.clone(), x])?;
    }
    assert_eq!(rt.trace_stats().traces, 1);
    assert_eq!(rt.trace_stats().cache_hits, 2);

    let wider = rt.ones(TensorSpec::new(DType::F32, [3]))?;
    rt.call(&region, &[wider.clone(), wider])?;
    let doubles = rt.ones(TensorSpec::new(DType::F64, [2]))?;
    rt.call(&region, &[doubles.clone(), doubles])?;
    assert_eq!(rt.trace_stats().traces, 3);
    assert_eq!(rt.trace_cache().len(), 3);
    Ok(())
}

#[test]
fn eager_mode_never_traces() -> Result<()> {
    let rt = runtime(JitPolicy::ForceEager, false)?;
    let x = rt.ones(TensorSpec::new(DType::F32, [2]))?;
    rt.call(&jit("annotated", |xs: &[Tensor]| Ok(vec![xs[0].exp()?])), &[x])?;
    assert_eq!(rt.trace_stats().traces, 0);
    Ok(())
}

#[test]
fn shape_errors_surface_in_both_modes() -> Result<()> {
    for policy in [JitPolicy::ForceEager, JitPolicy::ForceCompiled] {
        let rt = runtime(policy, false)?;
        let x = rt.ones(TensorSpec::new(DType::F32, [2, 3]))?;
        let y = rt.ones(TensorSpec::new(DType::F32, [4]))?;
        let err = rt.call(&add_region(), &[x, y]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape, "{policy}: {err}");
    }
    Ok(())
}

#[test]
fn transition_rejected_while_region_in_flight() -> Result<()> {
    let rt = runtime(JitPolicy::PerRegion, false)?;
    let region = CompiledRegion::new("switches_mode", |xs: &[Tensor]| {
        xs[0].runtime().transition(ExecutionMode::Compiled)?;
        Ok(vec![xs[0].clone()])
    });
    let x = rt.ones(TensorSpec::new(DType::F32, [1]))?;
    let err = rt.call(&region, &[x]).unwrap_err();
    assert!(matches!(
        err,
        TensorKitError::ModeTransition(ModeTransitionError::RegionInFlight { in_flight: 1, .. })
    ));
    assert_eq!(rt.controller().in_flight(), 0);
    rt.transition(ExecutionMode::Compiled)?;
    assert_eq!(rt.mode(), ExecutionMode::Compiled);
    Ok(())
}

#[test]
fn forced_policy_pins_the_mode() -> Result<()> {
    let rt = runtime(JitPolicy::ForceEager, false)?;
    let err = rt.transition(ExecutionMode::Compiled).unwrap_err();
    assert!(matches!(
        err,
        TensorKitError::ModeTransition(ModeTransitionError::Pinned { .. })
    ));
    rt.transition(ExecutionMode::Eager)?;
    Ok(())
}

#[test]
fn per_call_override_beats_annotation() -> Result<()> {
    let rt = runtime(JitPolicy::PerRegion, false)?;
    let region = jit("square", |xs: &[Tensor]| Ok(vec![xs[0].square()?]));
    let x = rt.floats([2], vec![3.0, -1.0])?;
    rt.call_with_mode(&region, &[x.clone()], ExecutionMode::Eager)?;
    assert_eq!(rt.trace_stats().traces, 0);
    let out = rt.call(&region, &[x])?;
    assert_eq!(rt.trace_stats().traces, 1);
    assert_eq!(out[0].to_vec::<f32>()?, vec![9.0, 1.0]);
    Ok(())
}

#[test]
fn redefined_region_discards_cached_traces() -> Result<()> {
    let rt = runtime(JitPolicy::ForceCompiled, false)?;
    let x = rt.floats([2], vec![1.0, 2.0])?;
    let first = CompiledRegion::new("step", |xs: &[Tensor]| Ok(vec![xs[0].add_scalar(1.0)?]));
    rt.call(&first, &[x.clone()])?;
    assert_eq!(rt.trace_cache().len(), 1);

    let second = CompiledRegion::new("step", |xs: &[Tensor]| Ok(vec![xs[0].mul_scalar(2.0)?]));
    let err = rt.call(&second, &[x.clone()]).unwrap_err();
    assert!(matches!(
        err,
        TensorKitError::Trace(TraceError::SourceChanged { .. })
    ));
    assert!(rt.trace_cache().is_empty());
    assert_eq!(rt.trace_stats().invalidations, 1);

    let out = rt.call(&second, &[x])?;
    assert_eq!(out[0].to_vec::<f32>()?, vec![2.0, 4.0]);
    Ok(())
}

fn scale_region(factor: f64) -> CompiledRegion {
    jit("scale", move |xs: &[Tensor]| Ok(vec![xs[0].mul_scalar(factor)?]))
}

#[test]
fn regions_with_different_captures_never_share_traces() -> Result<()> {
    for policy in [JitPolicy::ForceEager, JitPolicy::ForceCompiled] {
        let rt = runtime(policy, true)?;
        let x = rt.floats([2], vec![1.0, 2.0])?;
        let doubled = rt.call(&scale_region(2.0), &[x.clone()])?.remove(0);
        let tripled = rt.call(&scale_region(3.0), &[x.clone()])?.remove(0);
        assert_eq!(doubled.to_vec::<f32>()?, vec![2.0, 4.0], "{policy}");
        assert_eq!(tripled.to_vec::<f32>()?, vec![3.0, 6.0], "{policy}");
        if policy == JitPolicy::ForceCompiled {
            assert_eq!(rt.trace_stats().traces, 2);
            assert_eq!(rt.trace_stats().cache_hits, 0);
            assert_eq!(rt.trace_stats().invalidations, 0);
        }
    }
    Ok(())
}

#[test]
fn cloned_region_reuses_its_trace() -> Result<()> {
    let rt = runtime(JitPolicy::ForceCompiled, false)?;
    let region = scale_region(4.0);
    let copy = region.clone();
    let x = rt.floats([2], vec![1.0, 2.0])?;
    rt.call(&region, &[x.clone()])?;
    let out = rt.call(&copy, &[x])?.remove(0);
    assert_eq!(out.to_vec::<f32>()?, vec![4.0, 8.0]);
    assert_eq!(rt.trace_stats().traces, 1);
    assert_eq!(rt.trace_stats().cache_hits, 1);
    Ok(())
}

#[test]
fn gradients_match_in_both_modes() -> Result<()> {
    let region = CompiledRegion::new("quadratic", |xs: &[Tensor]| {
        let scaled = xs[0].mul(&xs[1])?;
        Ok(vec![scaled.square()?.reduce_sum(&[], false)?])
    });
    for policy in [JitPolicy::ForceEager, JitPolicy::ForceCompiled] {
        let rt = runtime(policy, false)?;
        let x = rt.floats([3], vec![1.0, 2.0, 3.0])?;
        let w = rt.floats([3], vec![0.5, -1.0, 2.0])?;
        let (value, grads) = rt.value_and_grad(&region, &[x, w])?;
        // f = sum((x w)^2); df/dx = 2 x w^2, df/dw = 2 x^2 w
        assert!((value.item()? - (0.25 + 4.0 + 36.0)).abs() < 1e-5);
        assert_eq!(grads[0].to_vec::<f32>()?, vec![0.5, 4.0, 24.0]);
        assert_eq!(grads[1].to_vec::<f32>()?, vec![1.0, -8.0, 36.0]);
    }
    Ok(())
}

#[test]
fn gradients_need_float_inputs() -> Result<()> {
    let rt = runtime(JitPolicy::ForceEager, false)?;
    let region = CompiledRegion::new("int_sum", |xs: &[Tensor]| Ok(vec![xs[0].reduce_sum(&[], false)?]));
    let x = rt.tensor([2], vec![1i32, 2])?;
    let err = rt.value_and_grad(&region, &[x]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dtype);
    Ok(())
}

#[test]
fn unknown_backend_is_a_configuration_error() {
    tensorkit_backend_ref_cpu::register_cpu_backend();
    let err = Runtime::new(RuntimeConfig::new("tpu")).unwrap_err();
    match err {
        TensorKitError::Configuration(ConfigurationError::UnknownBackend { name, available }) => {
            assert_eq!(name, "tpu");
            assert!(available.contains(&"cpu".to_string()));
        }
        other => panic!("expected UnknownBackend, got {other:?}"),
    }
}

#[test]
fn uniform_log_prob_and_bounds() -> Result<()> {
    let rt = runtime(JitPolicy::ForceEager, true)?;
    let uniform = Uniform::from_floats(&rt, 0.0, 4.0)?;
    let given = rt.floats([3], vec![-1.0, 1.0, 4.0])?;
    let log_prob = uniform.log_prob(&given)?.to_vec::<f32>()?;
    assert_eq!(log_prob[0], -1e7);
    assert!((f64::from(log_prob[1]) + 4.0f64.ln()).abs() < 1e-6);
    assert!((f64::from(log_prob[2]) + 4.0f64.ln()).abs() < 1e-6);

    let samples = uniform.with_shape(vec![2]).sample(Some(5), 11)?;
    assert_eq!(samples.dims(), &[5, 2]);
    assert!(samples.to_vec::<f32>()?.iter().all(|v| (0.0..4.0).contains(v)));

    let err = Uniform::from_floats(&rt, 1.0, 1.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let low = rt.floats([2], vec![0.0, 3.0])?;
    let high = rt.floats([2], vec![1.0, 2.0])?;
    assert_eq!(Uniform::new(&low, &high).unwrap_err().kind(), ErrorKind::NumericValidation);
    Ok(())
}

#[test]
fn uniform_from_traced_bounds_agrees_across_modes() -> Result<()> {
    let region = CompiledRegion::new("uniform_draw", |xs: &[Tensor]| {
        let uniform = Uniform::new(&xs[0], &xs[1])?;
        let draws = uniform.sample(None, 7)?;
        let log_prob = uniform.log_prob(&draws)?;
        Ok(vec![draws, log_prob])
    });
    let mut results = Vec::new();
    for policy in [JitPolicy::ForceEager, JitPolicy::ForceCompiled] {
        let rt = runtime(policy, true)?;
        let low = rt.floats([3], vec![0.0, -1.0, 2.0])?;
        let high = rt.floats([3], vec![1.0, 1.0, 6.0])?;
        let outputs = rt.call(&region, &[low, high])?;
        let draws = outputs[0].to_vec::<f32>()?;
        for ((draw, lo), hi) in draws.iter().zip([0.0, -1.0, 2.0]).zip([1.0, 1.0, 6.0]) {
            assert!((lo..=hi).contains(draw), "{policy}: {draw} outside [{lo}, {hi}]");
        }
        let log_prob = outputs[1].to_vec::<f32>()?;
        let expected = [0.0f64, -(2.0f64.ln()), -(4.0f64.ln())];
        for (got, want) in log_prob.iter().zip(expected) {
            assert!((f64::from(*got) - want).abs() < 1e-6, "{policy}: {got} vs {want}");
        }
        results.push(draws);
    }
    assert_eq!(results[0], results[1]);
    Ok(())
}

#[test]
fn reversed_traced_bounds_fail_validation_in_compiled_mode() -> Result<()> {
    let rt = runtime(JitPolicy::ForceCompiled, true)?;
    let region = CompiledRegion::new("uniform_reversed", |xs: &[Tensor]| {
        Ok(vec![Uniform::new(&xs[0], &xs[1])?.sample(None, 3)?])
    });
    let low = rt.floats([2], vec![0.0, 3.0])?;
    let high = rt.floats([2], vec![1.0, 2.0])?;
    let err = rt.call(&region, &[low, high]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NumericValidation, "{err}");
    Ok(())
}
