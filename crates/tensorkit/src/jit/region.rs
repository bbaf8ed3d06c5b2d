use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::hashing::FingerprintHasher;
use crate::error::Result;
use crate::runtime::ExecutionMode;
use crate::tensor::Tensor;

type RegionBody = dyn Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync;

static REGION_INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A named function over tensors that may run eagerly or be traced and replayed.
///
/// The fingerprint identifies the body's source: two regions built from different closures
/// under the same name have different fingerprints, which is how the cache notices a
/// redefinition. The instance id identifies one construction and is shared by clones, so
/// regions built from the same closure with different captured values never share a trace.
#[derive(Clone)]
pub struct CompiledRegion {
    name: Arc<str>,
    annotation: Option<ExecutionMode>,
    fingerprint: u64,
    instance: u64,
    body: Arc<RegionBody>,
}

impl CompiledRegion {
    /// Region without a mode annotation; the controller default decides how it runs.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        let mut hasher = FingerprintHasher::new();
        hasher.write(&TypeId::of::<F>());
        hasher.write(type_name::<F>());
        CompiledRegion {
            name: Arc::from(name.into()),
            annotation: None,
            fingerprint: hasher.finish(),
            instance: REGION_INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed),
            body: Arc::new(body),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.annotation = Some(mode);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn annotation(&self) -> Option<ExecutionMode> {
        self.annotation
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub(crate) fn invoke(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        (self.body)(inputs)
    }
}

impl fmt::Debug for CompiledRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRegion")
            .field("name", &self.name)
            .field("annotation", &self.annotation)
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint))
            .field("instance", &self.instance)
            .finish()
    }
}

/// Region annotated to run compiled unless the configuration forces eager execution.
pub fn jit<F>(name: impl Into<String>, body: F) -> CompiledRegion
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
{
    CompiledRegion::new(name, body).with_mode(ExecutionMode::Compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaled(factor: f64) -> CompiledRegion {
        CompiledRegion::new("scale", move |xs: &[Tensor]| Ok(vec![xs[0].mul_scalar(factor)?]))
    }

    #[test]
    fn clones_share_identity() {
        let region = scaled(2.0);
        let copy = region.clone();
        assert_eq!(region.instance(), copy.instance());
        assert_eq!(region.fingerprint(), copy.fingerprint());
    }

    #[test]
    fn captures_change_instance_not_fingerprint() {
        let (two, three) = (scaled(2.0), scaled(3.0));
        assert_eq!(two.fingerprint(), three.fingerprint());
        assert_ne!(two.instance(), three.instance());

        let other = CompiledRegion::new("scale", |xs: &[Tensor]| Ok(vec![xs[0].neg()?]));
        assert_ne!(other.fingerprint(), two.fingerprint());
    }
}
