//! Process-wide model cache.
//!
//! Resolving a model means loading the persisted copy or, failing that,
//! training a fresh one. At most one resolution runs at a time: callers that
//! arrive while one is in flight block on it and share its outcome. A
//! successful outcome is memoized until [`ModelCache::reset`]; a failed one
//! is not, so the next caller retries.
//!
//! ```text
//! Loading ──load ok──────────────────────► Ready
//!    │
//!    └─load failed─► Training ──trained──► Ready
//!                        └─────failed────► Error
//! ```

use crate::config::Config;
use crate::dataset::{DatasetSource, SpriteDataset};
use crate::error::{DigitError, Result};
use crate::network::{digit_network, LayerDescriptor, NetworkSpec};
use crate::runtime::{AprenderRuntime, FitReport, Runtime, StorageKey};
use crate::trainer::Trainer;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Observable phase of the cache.
#[derive(Debug, Clone)]
pub enum LifecycleState {
    /// Nothing resolved yet, or a persisted load is being attempted.
    Loading,
    /// No usable persisted model; a fresh one is being trained.
    Training,
    /// A model is memoized.
    Ready,
    /// The last resolution failed with this cause.
    Error(DigitError),
}

impl LifecycleState {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => f.write_str("loading"),
            Self::Training => f.write_str("training"),
            Self::Ready => f.write_str("ready"),
            Self::Error(cause) => write!(f, "error: {cause}"),
        }
    }
}

/// Progress hint delivered to the caller that starts a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    /// About to try the persisted model.
    Cached,
    /// About to train from scratch.
    Training,
}

impl fmt::Display for StatusHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cached => "cached",
            Self::Training => "training",
        })
    }
}

/// A resolved model together with the architecture it was built from.
///
/// Shared read-only; the cache replaces handles but never mutates one.
#[derive(Debug)]
pub struct ModelHandle<M> {
    spec: NetworkSpec,
    model: M,
    report: Option<FitReport>,
}

impl<M> ModelHandle<M> {
    #[must_use]
    pub fn new(spec: NetworkSpec, model: M) -> Self {
        Self {
            spec,
            model,
            report: None,
        }
    }

    /// Attach the history of the fit that produced the model.
    #[must_use]
    pub fn with_report(mut self, report: FitReport) -> Self {
        self.report = Some(report);
        self
    }

    #[must_use]
    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Fit history, present only for freshly trained models.
    #[must_use]
    pub fn fit_report(&self) -> Option<&FitReport> {
        self.report.as_ref()
    }

    /// Name and output shape of every layer.
    ///
    /// # Errors
    ///
    /// Propagates shape inference failures from the spec.
    pub fn layers(&self) -> Result<Vec<LayerDescriptor>> {
        self.spec.layers()
    }
}

type Outcome<M> = Result<Arc<ModelHandle<M>>>;

/// One resolution attempt, awaited by every caller that joins it.
struct Flight<M> {
    /// Thread running the resolution; it must never wait on itself.
    resolver: ThreadId,
    outcome: Mutex<Option<Outcome<M>>>,
    done: Condvar,
}

impl<M> Flight<M> {
    fn new(resolver: ThreadId) -> Self {
        Self {
            resolver,
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn publish(&self, outcome: Outcome<M>) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }

    fn wait(&self) -> Outcome<M> {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Slot<M> {
    memo: Option<Arc<ModelHandle<M>>>,
    flight: Option<Arc<Flight<M>>>,
    state: LifecycleState,
}

/// Fails its flight if dropped before completion, so a panicking resolver
/// never leaves waiters blocked.
struct FlightGuard<'a, R: Runtime, D: DatasetSource> {
    cache: &'a ModelCache<R, D>,
    flight: Arc<Flight<R::Model>>,
    completed: bool,
}

impl<R: Runtime, D: DatasetSource> FlightGuard<'_, R, D> {
    fn complete(mut self, outcome: Outcome<R::Model>) -> Outcome<R::Model> {
        self.completed = true;
        self.cache.finish(&self.flight, outcome.clone());
        outcome
    }
}

impl<R: Runtime, D: DatasetSource> Drop for FlightGuard<'_, R, D> {
    fn drop(&mut self) {
        if !self.completed {
            self.cache.finish(
                &self.flight,
                Err(DigitError::training_failed("model resolution panicked")),
            );
        }
    }
}

/// Single-flight, memoizing owner of the process-wide model.
pub struct ModelCache<R: Runtime, D: DatasetSource> {
    trainer: Trainer<R, D>,
    spec: NetworkSpec,
    slot: Mutex<Slot<R::Model>>,
}

impl<R: Runtime, D: DatasetSource> fmt::Debug for ModelCache<R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCache")
            .field("key", self.trainer.key())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<R: Runtime, D: DatasetSource> ModelCache<R, D> {
    /// Create an empty cache in the `Loading` state.
    #[must_use]
    pub fn new(trainer: Trainer<R, D>) -> Self {
        Self {
            trainer,
            spec: digit_network(),
            slot: Mutex::new(Slot {
                memo: None,
                flight: None,
                state: LifecycleState::Loading,
            }),
        }
    }

    /// Runtime used for loading, training and inference.
    #[must_use]
    pub fn runtime(&self) -> &R {
        self.trainer.runtime()
    }

    /// Key the model is persisted under.
    #[must_use]
    pub fn key(&self) -> &StorageKey {
        self.trainer.key()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lock().state.clone()
    }

    /// The memoized model, without triggering a resolution.
    #[must_use]
    pub fn cached(&self) -> Option<Arc<ModelHandle<R::Model>>> {
        self.lock().memo.clone()
    }

    /// Return the model, loading or training it on first use.
    ///
    /// Only the caller that starts a resolution has `on_status` invoked;
    /// callers joining an in-flight resolution block until it finishes and
    /// receive the same handle or the same error.
    ///
    /// `on_status` runs on the resolving thread. Calling back into the cache
    /// from it while the resolution is still running returns an error
    /// instead of waiting on itself.
    ///
    /// # Errors
    ///
    /// Returns `TrainingFailed` if no persisted model was usable and training
    /// failed, or if called from the thread currently resolving the model.
    pub fn load(&self, on_status: Option<&dyn Fn(StatusHint)>) -> Outcome<R::Model> {
        let flight = {
            let mut slot = self.lock();
            if let Some(memo) = &slot.memo {
                tracing::debug!(key = %self.key(), "model cache hit");
                return Ok(Arc::clone(memo));
            }
            if let Some(flight) = &slot.flight {
                if flight.resolver == thread::current().id() {
                    return Err(DigitError::training_failed(
                        "model requested from within its own resolution",
                    ));
                }
                let flight = Arc::clone(flight);
                drop(slot);
                tracing::debug!(key = %self.key(), "joining in-flight model resolution");
                return flight.wait();
            }
            let flight = Arc::new(Flight::new(thread::current().id()));
            slot.flight = Some(Arc::clone(&flight));
            slot.state = LifecycleState::Loading;
            flight
        };

        let guard = FlightGuard {
            cache: self,
            flight: Arc::clone(&flight),
            completed: false,
        };
        let outcome = self.resolve(&flight, on_status);
        guard.complete(outcome)
    }

    /// Layer names and output shapes of the model, resolving it if needed.
    ///
    /// # Errors
    ///
    /// Same as [`ModelCache::load`].
    pub fn layers(&self, on_status: Option<&dyn Fn(StatusHint)>) -> Result<Vec<LayerDescriptor>> {
        self.load(on_status)?.layers()
    }

    /// Forget the memoized model and detach any in-flight resolution.
    ///
    /// Callers already waiting on a detached resolution still get its
    /// result, but the cache does not keep it.
    pub fn reset(&self) {
        let mut slot = self.lock();
        slot.memo = None;
        slot.flight = None;
        slot.state = LifecycleState::Loading;
        tracing::info!(key = %self.key(), "model cache reset");
    }

    fn resolve(
        &self,
        flight: &Arc<Flight<R::Model>>,
        on_status: Option<&dyn Fn(StatusHint)>,
    ) -> Outcome<R::Model> {
        notify(on_status, StatusHint::Cached);
        match self.runtime().load(&self.spec, self.key()) {
            Ok(model) => {
                tracing::info!(key = %self.key(), "using persisted model");
                return Ok(Arc::new(ModelHandle::new(self.spec.clone(), model)));
            }
            Err(err) => {
                tracing::warn!(key = %self.key(), error = %err, "persisted model unusable, training");
            }
        }

        self.update_if_current(flight, |slot| slot.state = LifecycleState::Training);
        notify(on_status, StatusHint::Training);
        self.trainer.train().map(Arc::new)
    }

    fn finish(&self, flight: &Arc<Flight<R::Model>>, outcome: Outcome<R::Model>) {
        self.update_if_current(flight, |slot| {
            slot.flight = None;
            match &outcome {
                Ok(handle) => {
                    slot.memo = Some(Arc::clone(handle));
                    slot.state = LifecycleState::Ready;
                }
                Err(err) => {
                    tracing::error!(error = %err, "model resolution failed");
                    slot.state = LifecycleState::Error(err.clone());
                }
            }
        });
        flight.publish(outcome);
    }

    /// Apply `update` only while `flight` is still the attached one.
    fn update_if_current(
        &self,
        flight: &Arc<Flight<R::Model>>,
        update: impl FnOnce(&mut Slot<R::Model>),
    ) {
        let mut slot = self.lock();
        if slot
            .flight
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            update(&mut slot);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<R::Model>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModelCache<AprenderRuntime, SpriteDataset> {
    /// Cache backed by aprender, storing models where `config` says and
    /// training on the sprite dataset in `dataset_dir`.
    ///
    /// # Errors
    ///
    /// Returns `DigitError::Config` for an invalid configuration or storage
    /// key.
    pub fn open(config: &Config, dataset_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let runtime = Arc::new(AprenderRuntime::new(config.store.directory.clone()));
        let dataset = Arc::new(SpriteDataset::new(dataset_dir));
        let mut trainer = Trainer::new(runtime, dataset, config.training.clone());
        if let Some(key) = &config.store.key {
            trainer = trainer.with_key(StorageKey::new(key.clone())?);
        }
        Ok(Self::new(trainer))
    }
}

fn notify(on_status: Option<&dyn Fn(StatusHint)>, hint: StatusHint) {
    if let Some(callback) = on_status {
        callback(hint);
    }
}
