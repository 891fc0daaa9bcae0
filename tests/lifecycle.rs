//! Model cache behaviour against a scripted runtime and dataset.

#![allow(clippy::disallowed_methods)]

use apr_digits::config::{Config, TrainingConfig};
use apr_digits::dataset::{DatasetSource, MnistData};
use apr_digits::error::{DigitError, Result};
use apr_digits::inference::InferenceService;
use apr_digits::lifecycle::{LifecycleState, ModelCache, StatusHint};
use apr_digits::network::{CompileOptions, NetworkSpec, NUM_CLASSES};
use apr_digits::raster::{Raster, CANVAS_SIZE};
use apr_digits::runtime::{Examples, FitOptions, FitReport, Runtime, StorageKey};
use apr_digits::tensor::{CanonicalTensor, TENSOR_LEN};
use apr_digits::trainer::Trainer;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runtime whose models are just build counters.
#[derive(Default)]
struct ScriptedRuntime {
    loads: AtomicUsize,
    builds: AtomicUsize,
    fits: AtomicUsize,
    saves: AtomicUsize,
    stored: AtomicBool,
    fail_fit: AtomicBool,
    panic_fit: AtomicBool,
    fail_predict: AtomicBool,
    fit_delay_ms: AtomicUsize,
    last_input: Mutex<Option<CanonicalTensor>>,
}

impl ScriptedRuntime {
    fn with_stored_model() -> Self {
        let runtime = Self::default();
        runtime.stored.store(true, Ordering::SeqCst);
        runtime
    }

    fn slow(delay_ms: usize) -> Self {
        let runtime = Self::default();
        runtime.fit_delay_ms.store(delay_ms, Ordering::SeqCst);
        runtime
    }
}

impl Runtime for ScriptedRuntime {
    type Model = usize;

    fn build(&self, _spec: &NetworkSpec, _options: &CompileOptions) -> Result<usize> {
        Ok(self.builds.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn fit(
        &self,
        _model: &mut usize,
        train: &Examples,
        _validation: &Examples,
        _options: &FitOptions,
    ) -> Result<FitReport> {
        thread::sleep(Duration::from_millis(
            self.fit_delay_ms.load(Ordering::SeqCst) as u64,
        ));
        self.fits.fetch_add(1, Ordering::SeqCst);
        assert!(!train.is_empty());
        if self.panic_fit.load(Ordering::SeqCst) {
            panic!("scripted panic");
        }
        if self.fail_fit.load(Ordering::SeqCst) {
            return Err(DigitError::training_failed("loss diverged"));
        }
        Ok(FitReport::default())
    }

    fn predict(&self, _model: &usize, input: &CanonicalTensor) -> Result<Vec<f32>> {
        *self.last_input.lock().unwrap() = Some(input.clone());
        if self.fail_predict.load(Ordering::SeqCst) {
            return Err(DigitError::Aprender("kernel fault".to_string()));
        }
        Ok(vec![0.1; NUM_CLASSES])
    }

    fn save(&self, _model: &usize, _spec: &NetworkSpec, _key: &StorageKey) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.stored.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, _spec: &NetworkSpec, key: &StorageKey) -> Result<usize> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.stored.load(Ordering::SeqCst) {
            Ok(0)
        } else {
            Err(DigitError::persisted_load_failed(format!("{key} not found")))
        }
    }
}

/// Dataset with six training and three test examples.
#[derive(Default)]
struct CountingDataset {
    loads: AtomicUsize,
    unavailable: AtomicBool,
}

fn one_hot_rows(count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|i| (0..NUM_CLASSES).map(move |c| u8::from(c == i % NUM_CLASSES)))
        .collect()
}

impl DatasetSource for CountingDataset {
    fn load(&self) -> Result<MnistData> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DigitError::dataset_unavailable("sprite request failed"));
        }
        Ok(MnistData {
            train_images: vec![0.5; 6 * TENSOR_LEN],
            train_labels: one_hot_rows(6),
            test_images: vec![0.25; 3 * TENSOR_LEN],
            test_labels: one_hot_rows(3),
        })
    }
}

type Cache = ModelCache<ScriptedRuntime, CountingDataset>;

fn cache_with(runtime: ScriptedRuntime) -> (Arc<Cache>, Arc<ScriptedRuntime>, Arc<CountingDataset>) {
    init_tracing();
    let runtime = Arc::new(runtime);
    let dataset = Arc::new(CountingDataset::default());
    let config = TrainingConfig::default().with_subsets(4, 2).with_seed(11);
    let trainer = Trainer::new(Arc::clone(&runtime), Arc::clone(&dataset), config);
    (Arc::new(ModelCache::new(trainer)), runtime, dataset)
}

fn wait_for_training(cache: &Cache) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !matches!(cache.state(), LifecycleState::Training) {
        assert!(Instant::now() < deadline, "cache never entered Training");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_concurrent_callers_share_one_training() {
    let (cache, runtime, dataset) = cache_with(ScriptedRuntime::slow(50));

    let handles: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..8).map(|_| s.spawn(|| cache.load(None))).collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect()
    });

    assert_eq!(runtime.fits.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.saves.load(Ordering::SeqCst), 1);
    assert_eq!(dataset.loads.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert!(cache.state().is_ready());
}

#[test]
fn test_success_is_memoized() {
    let (cache, runtime, dataset) = cache_with(ScriptedRuntime::default());

    let first = cache.load(None).unwrap();
    let second = cache.load(None).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);
    assert_eq!(dataset.loads.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&cache.cached().unwrap(), &first));
    assert!(first.fit_report().is_some());
}

#[test]
fn test_persisted_model_skips_training() {
    let (cache, runtime, dataset) = cache_with(ScriptedRuntime::with_stored_model());
    let hints = Mutex::new(Vec::new());
    let record = |hint: StatusHint| hints.lock().unwrap().push(hint);

    cache.load(Some(&record)).unwrap();

    assert_eq!(*hints.lock().unwrap(), vec![StatusHint::Cached]);
    assert_eq!(runtime.fits.load(Ordering::SeqCst), 0);
    assert_eq!(dataset.loads.load(Ordering::SeqCst), 0);
    assert!(cache.state().is_ready());
}

#[test]
fn test_empty_store_falls_back_to_training() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::default());
    let hints = Mutex::new(Vec::new());
    let record = |hint: StatusHint| hints.lock().unwrap().push(hint);

    let handle = cache.load(Some(&record)).unwrap();

    assert_eq!(
        *hints.lock().unwrap(),
        vec![StatusHint::Cached, StatusHint::Training]
    );
    assert_eq!(runtime.fits.load(Ordering::SeqCst), 1);
    assert_eq!(*handle.model(), 1);
}

#[test]
fn test_reset_yields_a_new_handle() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::default());

    let before = cache.load(None).unwrap();
    cache.reset();
    assert!(matches!(cache.state(), LifecycleState::Loading));
    assert!(cache.cached().is_none());

    let after = cache.load(None).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    // The first resolution persisted its model, so the second one loads it.
    assert_eq!(runtime.fits.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.loads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failure_is_not_memoized() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::default());
    runtime.fail_fit.store(true, Ordering::SeqCst);

    let err = cache.load(None).unwrap_err();
    assert!(matches!(err, DigitError::TrainingFailed { .. }));
    assert!(cache.state().is_error());
    assert!(cache.cached().is_none());
    assert_eq!(runtime.saves.load(Ordering::SeqCst), 0);

    runtime.fail_fit.store(false, Ordering::SeqCst);
    cache.load(None).unwrap();
    assert_eq!(runtime.fits.load(Ordering::SeqCst), 2);
    assert!(cache.state().is_ready());
}

#[test]
fn test_dataset_failure_surfaces_as_training_failure() {
    let (cache, _, dataset) = cache_with(ScriptedRuntime::default());
    dataset.unavailable.store(true, Ordering::SeqCst);

    match cache.layers(None).unwrap_err() {
        DigitError::TrainingFailed { reason } => {
            assert!(reason.contains("sprite request failed"), "{reason}");
        }
        other => panic!("expected TrainingFailed, got {other:?}"),
    }
    match cache.state() {
        LifecycleState::Error(DigitError::TrainingFailed { .. }) => {}
        other => panic!("unexpected state {other}"),
    }
}

#[test]
fn test_waiters_share_the_failure() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::slow(100));
    runtime.fail_fit.store(true, Ordering::SeqCst);

    let results: Vec<_> = thread::scope(|s| {
        let leader = s.spawn(|| cache.load(None));
        wait_for_training(&cache);
        let followers: Vec<_> = (0..3).map(|_| s.spawn(|| cache.load(None))).collect();
        std::iter::once(leader)
            .chain(followers)
            .map(|w| w.join().unwrap())
            .collect()
    });

    assert!(results.iter().all(Result::is_err));
    assert_eq!(runtime.fits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_only_the_starting_caller_gets_hints() {
    let (cache, _, _) = cache_with(ScriptedRuntime::slow(100));
    let leader_hints = AtomicUsize::new(0);
    let follower_hints = AtomicUsize::new(0);

    thread::scope(|s| {
        let leader = s.spawn(|| {
            let hint = |_: StatusHint| {
                leader_hints.fetch_add(1, Ordering::SeqCst);
            };
            cache.load(Some(&hint))
        });
        wait_for_training(&cache);
        let follower = s.spawn(|| {
            let hint = |_: StatusHint| {
                follower_hints.fetch_add(1, Ordering::SeqCst);
            };
            cache.load(Some(&hint))
        });
        let a = leader.join().unwrap().unwrap();
        let b = follower.join().unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    });

    assert_eq!(leader_hints.load(Ordering::SeqCst), 2);
    assert_eq!(follower_hints.load(Ordering::SeqCst), 0);
}

#[test]
fn test_reset_during_training_detaches_the_flight() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::slow(100));

    thread::scope(|s| {
        let stale = s.spawn(|| cache.load(None));
        wait_for_training(&cache);
        cache.reset();
        // The detached caller still gets its model.
        assert!(stale.join().unwrap().is_ok());
    });

    assert!(cache.cached().is_none());
    assert!(matches!(cache.state(), LifecycleState::Loading));

    // The next call starts over and finds the model the stale flight saved.
    cache.load(None).unwrap();
    assert_eq!(runtime.fits.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.loads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_panicking_resolution_releases_the_cache() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::default());
    runtime.panic_fit.store(true, Ordering::SeqCst);

    let outcome = thread::scope(|s| s.spawn(|| cache.load(None)).join());
    assert!(outcome.is_err());
    match cache.state() {
        LifecycleState::Error(DigitError::TrainingFailed { reason }) => {
            assert!(reason.contains("panicked"));
        }
        other => panic!("unexpected state {other}"),
    }

    runtime.panic_fit.store(false, Ordering::SeqCst);
    assert!(cache.load(None).is_ok());
}

#[test]
fn test_inference_failure_leaves_state_ready() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::default());
    let service = InferenceService::new(Arc::clone(&cache));
    cache.load(None).unwrap();

    runtime.fail_predict.store(true, Ordering::SeqCst);
    let err = service.predict(&CanonicalTensor::zeros()).unwrap_err();
    assert!(matches!(err, DigitError::InferenceFailed { .. }));
    assert!(cache.state().is_ready());
}

#[test]
fn test_blank_canvas_prediction() {
    let (cache, _, _) = cache_with(ScriptedRuntime::default());
    let service = InferenceService::new(cache);

    let scores = service
        .predict_raster(&Raster::blank(CANVAS_SIZE, CANVAS_SIZE))
        .unwrap();

    assert_eq!(scores.as_slice().len(), NUM_CLASSES);
    assert!(scores.as_slice().iter().all(|&s| s >= 0.0));
    assert!(service.cache().state().is_ready());
}

#[test]
fn test_layers_through_cache() {
    let (cache, _, _) = cache_with(ScriptedRuntime::with_stored_model());
    let layers = cache.layers(None).unwrap();
    let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "Conv2D",
            "MaxPooling2D",
            "Conv2D",
            "MaxPooling2D",
            "Flatten",
            "Dense",
            "Dropout",
            "Dense"
        ]
    );
    assert_eq!(layers[4].output_shape, "[batch, 800]");
    assert_eq!(layers[7].output_shape, "[batch, 10]");
}

#[test]
fn test_normalize_config_reaches_prediction() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::with_stored_model());
    let config = Config::from_toml_str("[normalize]\nink_threshold = 60").unwrap();
    let mut faint = Raster::blank(CANVAS_SIZE, CANVAS_SIZE);
    for y in 100..180 {
        faint.put_pixel(140, y, image::Rgba([50, 50, 50, 255]));
    }

    let strict = InferenceService::from_config(Arc::clone(&cache), &config).unwrap();
    strict.predict_raster(&faint).unwrap();
    let seen = runtime.last_input.lock().unwrap().take().unwrap();
    assert!(seen.is_blank());

    let lenient = InferenceService::new(cache);
    lenient.predict_raster(&faint).unwrap();
    let seen = runtime.last_input.lock().unwrap().take().unwrap();
    assert!((seen.max() - 1.0).abs() < 1e-6);
}

#[test]
fn test_status_callback_may_call_back_into_the_cache() {
    let (cache, runtime, _) = cache_with(ScriptedRuntime::default());
    let (done, finished) = mpsc::channel();

    let worker = Arc::clone(&cache);
    thread::spawn(move || {
        let nested = Mutex::new(Vec::new());
        let on_status = |hint: StatusHint| {
            let inner = worker.load(None).map(|_| ());
            let layers = worker.layers(None).map(|_| ());
            nested.lock().unwrap().push((hint, inner, layers));
        };
        let outcome = worker.load(Some(&on_status)).map(|_| ());
        let _ = done.send((outcome, nested.into_inner().unwrap()));
    });

    let (outcome, nested) = finished
        .recv_timeout(Duration::from_secs(5))
        .expect("load from inside on_status never returned");
    assert!(outcome.is_ok());
    assert_eq!(nested.len(), 2);
    for (_, inner, layers) in &nested {
        assert!(matches!(inner, Err(DigitError::TrainingFailed { .. })));
        assert!(matches!(layers, Err(DigitError::TrainingFailed { .. })));
    }
    assert_eq!(runtime.fits.load(Ordering::SeqCst), 1);
    assert!(cache.state().is_ready());
}
