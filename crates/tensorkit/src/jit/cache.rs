//! Trace cache keyed by region identity and input signature.
//!
//! Each key owns a slot guarded by its own lock, so a trace for one key never blocks
//! callers of another key, while concurrent callers of the same key wait for the first
//! trace and then reuse it. Failed traces leave the slot empty.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::spec::{Program, TensorSpec};
use crate::error::{Result, TensorKitError, TraceError};
use crate::jit::region::CompiledRegion;

/// Which program a cache entry holds for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Forward,
    ValueAndGrad,
}

/// Cache key. Besides the region name it carries the body fingerprint and the region
/// instance, so a trace is only ever replayed for the region object that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceKey {
    pub region: String,
    pub fingerprint: u64,
    pub instance: u64,
    pub kind: TraceKind,
    pub signature: Vec<TensorSpec>,
}

impl TraceKey {
    pub fn new(region: &CompiledRegion, kind: TraceKind, signature: Vec<TensorSpec>) -> Self {
        Self {
            region: region.name().to_string(),
            fingerprint: region.fingerprint(),
            instance: region.instance(),
            kind,
            signature,
        }
    }
}

impl fmt::Display for TraceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signature = self
            .signature
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        match self.kind {
            TraceKind::Forward => write!(f, "{}#{}[{signature}]", self.region, self.instance),
            TraceKind::ValueAndGrad => {
                write!(f, "{}#{}'grad[{signature}]", self.region, self.instance)
            }
        }
    }
}

/// A traced program ready for replay.
#[derive(Debug)]
pub struct Trace {
    pub key: TraceKey,
    pub program: Program,
}

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub traces: u64,
    pub cache_hits: u64,
    pub invalidations: u64,
}

/// Observer notified about cache events.
pub trait TraceSink: Send + Sync {
    fn on_trace(&self, _key: &TraceKey, _program: &Program) {}

    fn on_cache_hit(&self, _key: &TraceKey) {}

    fn on_invalidate(&self, _region: &str, _discarded: usize) {}
}

#[derive(Default)]
struct TraceSlot {
    trace: Mutex<Option<Arc<Trace>>>,
}

/// Fingerprint and instance last seen for a region name.
#[derive(Debug, Clone, Copy)]
struct RegionIdentity {
    fingerprint: u64,
    instance: u64,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<TraceKey, Arc<TraceSlot>>,
    regions: HashMap<String, RegionIdentity>,
}

impl CacheState {
    fn discard_region(&mut self, region: &str) -> usize {
        let before = self.slots.len();
        self.slots.retain(|key, _| key.region != region);
        before - self.slots.len()
    }
}

#[derive(Default)]
pub struct TraceCache {
    state: Mutex<CacheState>,
    traces: AtomicU64,
    cache_hits: AtomicU64,
    invalidations: AtomicU64,
    sink: RwLock<Option<Arc<dyn TraceSink>>>,
}

impl TraceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&self, sink: Option<Arc<dyn TraceSink>>) {
        *self.sink.write() = sink;
    }

    /// Returns the cached trace for `key`, tracing it with `trace_fn` on a miss.
    ///
    /// The region identity is checked under the same lock that hands out slots. A new
    /// fingerprint for a known name discards every cached trace of that region and fails
    /// this call with [`TraceError::SourceChanged`]; the next call traces afresh. A new
    /// instance with an unchanged fingerprint replaces the previous instance's traces
    /// without an error.
    pub fn get_or_trace<F>(&self, key: TraceKey, trace_fn: F) -> Result<Arc<Trace>>
    where
        F: FnOnce() -> Result<Program>,
    {
        let slot = {
            let mut state = self.state.lock();
            let seen = RegionIdentity {
                fingerprint: key.fingerprint,
                instance: key.instance,
            };
            match state.regions.insert(key.region.clone(), seen) {
                Some(known) if known.fingerprint != key.fingerprint => {
                    let discarded = state.discard_region(&key.region);
                    drop(state);
                    return Err(self.source_changed(&key.region, discarded));
                }
                Some(known) if known.instance != key.instance => {
                    let discarded = state.discard_region(&key.region);
                    tracing::debug!(
                        region = %key.region,
                        discarded,
                        "new region instance, dropping traces of the previous one"
                    );
                }
                _ => {}
            }
            Arc::clone(state.slots.entry(key.clone()).or_default())
        };

        let mut entry = slot.trace.lock();
        if let Some(trace) = entry.as_ref() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "trace cache hit");
            if let Some(sink) = self.sink.read().as_ref() {
                sink.on_cache_hit(&key);
            }
            return Ok(Arc::clone(trace));
        }

        let program = trace_fn()?;
        tracing::debug!(
            key = %key,
            instructions = program.entry_function().map_or(0, |f| f.body.len()),
            "traced compiled region"
        );
        self.traces.fetch_add(1, Ordering::Relaxed);
        if let Some(sink) = self.sink.read().as_ref() {
            sink.on_trace(&key, &program);
        }
        let trace = Arc::new(Trace { key, program });
        *entry = Some(Arc::clone(&trace));
        Ok(trace)
    }

    fn source_changed(&self, region: &str, discarded: usize) -> TensorKitError {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(region, discarded, "region redefined, discarding cached traces");
        if let Some(sink) = self.sink.read().as_ref() {
            sink.on_invalidate(region, discarded);
        }
        TraceError::SourceChanged {
            region: region.to_string(),
        }
        .into()
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            traces: self.traces.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<TraceSlot>> = self.state.lock().slots.values().cloned().collect();
        slots
            .iter()
            .filter(|slot| slot.trace.lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::DType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn identified(region: &str, fingerprint: u64, instance: u64, dims: &[usize]) -> TraceKey {
        TraceKey {
            region: region.to_string(),
            fingerprint,
            instance,
            kind: TraceKind::Forward,
            signature: vec![TensorSpec::new(DType::F32, dims)],
        }
    }

    fn key(region: &str, dims: &[usize]) -> TraceKey {
        identified(region, 1, 1, dims)
    }

    #[test]
    fn traces_once_per_key() {
        let cache = TraceCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_trace(key("f", &[2]), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Program::new("f"))
                })
                .unwrap();
        }
        cache
            .get_or_trace(key("f", &[3]), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Program::new("f"))
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.stats(),
            TraceStats {
                traces: 2,
                cache_hits: 2,
                invalidations: 0
            }
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_trace_is_not_cached() {
        let cache = TraceCache::new();
        let err = cache
            .get_or_trace(key("f", &[2]), || {
                Err(TraceError::ConcretizationRequired { operation: "item" }.into())
            })
            .unwrap_err();
        assert!(matches!(err, TensorKitError::Trace(_)));
        assert!(cache.is_empty());
        cache
            .get_or_trace(key("f", &[2]), || Ok(Program::new("f")))
            .unwrap();
        assert_eq!(cache.stats().traces, 1);
    }

    #[test]
    fn fingerprint_change_discards_region_traces() {
        let cache = TraceCache::new();
        cache
            .get_or_trace(identified("f", 1, 1, &[2]), || Ok(Program::new("f")))
            .unwrap();
        cache
            .get_or_trace(identified("g", 1, 2, &[2]), || Ok(Program::new("g")))
            .unwrap();

        let err = cache
            .get_or_trace(identified("f", 2, 3, &[2]), || Ok(Program::new("f")))
            .unwrap_err();
        assert_eq!(
            err,
            TensorKitError::Trace(TraceError::SourceChanged {
                region: "f".to_string()
            })
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().invalidations, 1);

        let trace = cache
            .get_or_trace(identified("f", 2, 3, &[2]), || Ok(Program::new("f2")))
            .unwrap();
        assert_eq!(trace.program.entry, "f2");
    }

    #[test]
    fn new_instance_never_reuses_previous_trace() {
        let cache = TraceCache::new();
        cache
            .get_or_trace(identified("scale", 7, 1, &[2]), || Ok(Program::new("times_two")))
            .unwrap();
        let trace = cache
            .get_or_trace(identified("scale", 7, 2, &[2]), || {
                Ok(Program::new("times_three"))
            })
            .unwrap();
        assert_eq!(trace.program.entry, "times_three");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().traces, 2);
        assert_eq!(cache.stats().invalidations, 0);
    }

    #[test]
    fn redefinition_during_trace_does_not_leak_stale_program() {
        let cache = Arc::new(TraceCache::new());
        let (started_tx, started_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        let tracer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache
                    .get_or_trace(identified("f", 1, 1, &[2]), move || {
                        started_tx.send(()).unwrap();
                        resume_rx.recv().unwrap();
                        Ok(Program::new("old"))
                    })
                    .map(|trace| trace.program.entry.clone())
            })
        };

        started_rx.recv().unwrap();
        let err = cache
            .get_or_trace(identified("f", 2, 2, &[2]), || Ok(Program::new("new")))
            .unwrap_err();
        assert!(matches!(
            err,
            TensorKitError::Trace(TraceError::SourceChanged { .. })
        ));
        resume_tx.send(()).unwrap();
        assert_eq!(tracer.join().unwrap().unwrap(), "old");

        let trace = cache
            .get_or_trace(identified("f", 2, 2, &[2]), || Ok(Program::new("new")))
            .unwrap();
        assert_eq!(trace.program.entry, "new");
        assert_eq!(trace.key.fingerprint, 2);
    }

    #[test]
    fn concurrent_callers_share_one_trace() {
        let cache = Arc::new(TraceCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache
                        .get_or_trace(key("shared", &[4]), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(Program::new("shared"))
                        })
                        .map(|_| ())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().cache_hits, 3);
    }

    #[derive(Default)]
    struct CountingSink {
        traces: AtomicUsize,
        hits: AtomicUsize,
    }

    impl TraceSink for CountingSink {
        fn on_trace(&self, _key: &TraceKey, _program: &Program) {
            self.traces.fetch_add(1, Ordering::SeqCst);
        }

        fn on_cache_hit(&self, _key: &TraceKey) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sink_observes_events() {
        let cache = TraceCache::new();
        let sink = Arc::new(CountingSink::default());
        cache.set_sink(Some(sink.clone() as Arc<dyn TraceSink>));
        for _ in 0..2 {
            cache
                .get_or_trace(key("f", &[1]), || Ok(Program::new("f")))
                .unwrap();
        }
        assert_eq!(sink.traces.load(Ordering::SeqCst), 1);
        assert_eq!(sink.hits.load(Ordering::SeqCst), 1);
    }
}
