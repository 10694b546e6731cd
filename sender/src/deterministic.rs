//! A deterministic discrete-event clock that fires scheduled callbacks in virtual time.
//!
//! Nothing here blocks or sleeps: the [Runner] pops the earliest pending [Alarm], jumps virtual
//! time to it, and invokes its callback. Alarms due at the same instant fire in the order they
//! were scheduled.
//!
//! # Panics
//!
//! If any callback panics, the panic propagates out of the [Runner] (and the simulation halts).
//!
//! # Example
//!
//! ```rust
//! use periodic_sender::{deterministic::Executor, Clock};
//! use std::time::Duration;
//!
//! let (runner, context, auditor) = Executor::default();
//! let inner = context.clone();
//! context.schedule(Duration::from_secs(1), move || {
//!     println!("fired at {:?}", inner.current());
//! });
//! runner.run_until(Duration::from_secs(5));
//! println!("Auditor state: {}", auditor.state());
//! ```

use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::{Metric, Registry},
};
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::trace;

/// Prefix for executor metrics.
const METRICS_PREFIX: &str = "runtime";

/// A callback waiting for its [Alarm].
type Callback = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
struct Metrics {
    alarms_scheduled: Counter,
    alarms_fired: Counter,
    alarms_cancelled: Counter,
    alarms_pending: Gauge,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            alarms_scheduled: Counter::default(),
            alarms_fired: Counter::default(),
            alarms_cancelled: Counter::default(),
            alarms_pending: Gauge::default(),
        };
        registry.register(
            "alarms_scheduled",
            "Total number of alarms scheduled",
            metrics.alarms_scheduled.clone(),
        );
        registry.register(
            "alarms_fired",
            "Total number of alarms fired",
            metrics.alarms_fired.clone(),
        );
        registry.register(
            "alarms_cancelled",
            "Total number of alarms cancelled before firing",
            metrics.alarms_cancelled.clone(),
        );
        registry.register(
            "alarms_pending",
            "Number of alarms waiting to fire",
            metrics.alarms_pending.clone(),
        );
        metrics
    }
}

/// Track the state of the clock for determinism auditing.
pub struct Auditor {
    hash: Mutex<Vec<u8>>,
}

impl Default for Auditor {
    fn default() -> Self {
        Self {
            hash: Vec::new().into(),
        }
    }
}

impl Auditor {
    fn record(&self, event: &[u8], alarm: Alarm) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(event);
        hasher.update(alarm.time.as_nanos().to_be_bytes());
        hasher.update(alarm.sequence.to_be_bytes());
        *hash = hasher.finalize().to_vec();
    }

    fn schedule(&self, alarm: Alarm) {
        self.record(b"schedule", alarm);
    }

    fn fire(&self, alarm: Alarm) {
        self.record(b"fire", alarm);
    }

    fn cancel(&self, alarm: Alarm) {
        self.record(b"cancel", alarm);
    }

    fn rand(&self, method: &str) {
        let mut hash = self.hash.lock().unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&*hash);
        hasher.update(b"rand");
        hasher.update(method.as_bytes());
        *hash = hasher.finalize().to_vec();
    }

    /// Generate a representation of the current state of the clock.
    ///
    /// This can be used to ensure that logic running on top
    /// of the clock is interacting deterministically.
    pub fn state(&self) -> String {
        let hash = self.hash.lock().unwrap();
        hash.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

/// Configuration for the `deterministic` clock.
#[derive(Clone)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// If virtual time would advance past this point, panic.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            timeout: None,
        }
    }
}

/// Reference to a scheduled callback.
///
/// Alarms order by virtual time and then by the order in which they were scheduled.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Alarm {
    time: Duration,
    sequence: u64,
}

impl Alarm {
    /// Virtual time at which the alarm fires.
    pub fn time(&self) -> Duration {
        self.time
    }
}

struct State {
    time: Duration,
    sequence: u64,
    alarms: BTreeMap<Alarm, Callback>,
}

/// Deterministic clock that fires callbacks in virtual time.
pub struct Executor {
    registry: Mutex<Registry>,
    deadline: Option<Duration>,
    metrics: Metrics,
    auditor: Arc<Auditor>,
    rng: Mutex<StdRng>,
    state: Mutex<State>,
}

impl Executor {
    /// Initialize a new `deterministic` clock with the given configuration.
    pub fn init(cfg: Config) -> (Runner, Context, Arc<Auditor>) {
        // Create a new registry
        let mut registry = Registry::default();
        let metrics = Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX));

        // Initialize clock
        let auditor = Arc::new(Auditor::default());
        let executor = Arc::new(Self {
            registry: Mutex::new(registry),
            deadline: cfg.timeout,
            metrics,
            auditor: auditor.clone(),
            rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
            state: Mutex::new(State {
                time: Duration::ZERO,
                sequence: 0,
                alarms: BTreeMap::new(),
            }),
        });
        (
            Runner {
                executor: executor.clone(),
            },
            Context {
                label: String::new(),
                executor,
            },
            auditor,
        )
    }

    /// Initialize a new `deterministic` clock with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> (Runner, Context, Arc<Auditor>) {
        let cfg = Config {
            seed,
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` clock with the default configuration
    /// but panic if virtual time passes the given timeout.
    pub fn timed(timeout: Duration) -> (Runner, Context, Arc<Auditor>) {
        let cfg = Config {
            timeout: Some(timeout),
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` clock with the default configuration.
    // We'd love to implement the trait but we can't because of the return type.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> (Runner, Context, Arc<Auditor>) {
        Self::init(Config::default())
    }

    fn advance(&self, state: &mut State, time: Duration) {
        if let Some(deadline) = self.deadline {
            if time > deadline {
                panic!("runtime timeout");
            }
        }
        state.time = time;
    }
}

/// Drives a `deterministic` clock forward.
pub struct Runner {
    executor: Arc<Executor>,
}

impl Runner {
    /// Fire every alarm due at or before `deadline` (including alarms scheduled by
    /// callbacks along the way), then park virtual time at `deadline`.
    ///
    /// If virtual time is already past `deadline`, nothing fires and time does not move.
    ///
    /// A callback that keeps rescheduling itself with a zero delay never lets virtual
    /// time reach `deadline`, so this never returns.
    pub fn run_until(&self, deadline: Duration) {
        while self.step(Some(deadline)) {}
        let mut state = self.executor.state.lock().unwrap();
        if state.time < deadline {
            self.executor.advance(&mut state, deadline);
            trace!(now = ?deadline, "time parked");
        }
    }

    /// Fire alarms until none remain.
    pub fn run(&self) {
        while self.step(None) {}
    }

    /// Fire the earliest pending alarm, if it is due at or before `bound`.
    ///
    /// Returns `false` if no alarm was fired.
    fn step(&self, bound: Option<Duration>) -> bool {
        // Pop the next alarm (dropping the lock before running it, so the
        // callback may schedule or cancel)
        let (alarm, callback) = {
            let mut state = self.executor.state.lock().unwrap();
            let Some(entry) = state.alarms.first_entry() else {
                return false;
            };
            if bound.is_some_and(|bound| entry.key().time > bound) {
                return false;
            }
            let (alarm, callback) = entry.remove_entry();
            self.executor.advance(&mut state, alarm.time);
            (alarm, callback)
        };
        self.executor.auditor.fire(alarm);
        self.executor.metrics.alarms_fired.inc();
        self.executor.metrics.alarms_pending.dec();
        trace!(now = ?alarm.time, sequence = alarm.sequence, "alarm fired");

        callback();
        true
    }
}

/// Implementation of [crate::Clock] and [crate::Metrics] for the `deterministic` clock.
#[derive(Clone)]
pub struct Context {
    label: String,
    executor: Arc<Executor>,
}

impl Context {
    /// Number of alarms waiting to fire.
    pub fn pending(&self) -> usize {
        self.executor.state.lock().unwrap().alarms.len()
    }
}

impl crate::Clock for Context {
    type Handle = Alarm;

    fn current(&self) -> Duration {
        self.executor.state.lock().unwrap().time
    }

    fn schedule<F>(&self, delay: Duration, callback: F) -> Alarm
    where
        F: FnOnce() + Send + 'static,
    {
        let alarm = {
            let mut state = self.executor.state.lock().unwrap();
            let time = state
                .time
                .checked_add(delay)
                .expect("overflow when setting alarm time");
            let alarm = Alarm {
                time,
                sequence: state.sequence,
            };
            state.sequence += 1;
            state.alarms.insert(alarm, Box::new(callback));
            alarm
        };
        self.executor.auditor.schedule(alarm);
        self.executor.metrics.alarms_scheduled.inc();
        self.executor.metrics.alarms_pending.inc();
        trace!(at = ?alarm.time, sequence = alarm.sequence, "alarm scheduled");
        alarm
    }

    fn cancel(&self, alarm: Alarm) -> bool {
        let removed = self
            .executor
            .state
            .lock()
            .unwrap()
            .alarms
            .remove(&alarm)
            .is_some();
        if removed {
            self.executor.auditor.cancel(alarm);
            self.executor.metrics.alarms_cancelled.inc();
            self.executor.metrics.alarms_pending.dec();
            trace!(at = ?alarm.time, sequence = alarm.sequence, "alarm cancelled");
        }
        removed
    }
}

impl crate::Metrics for Context {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn with_label(&self, label: &str) -> Self {
        let label = {
            let prefix = self.label.clone();
            if prefix.is_empty() {
                label.to_string()
            } else {
                format!("{prefix}_{label}")
            }
        };
        assert!(
            !label.starts_with(METRICS_PREFIX),
            "using runtime label is not allowed"
        );
        Self {
            label,
            executor: self.executor.clone(),
        }
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        let prefixed_name = {
            let prefix = &self.label;
            if prefix.is_empty() {
                name
            } else {
                format!("{prefix}_{name}")
            }
        };
        self.executor
            .registry
            .lock()
            .unwrap()
            .register(prefixed_name, help, metric)
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.executor.auditor.rand("next_u32");
        self.executor.rng.lock().unwrap().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.executor.auditor.rand("next_u64");
        self.executor.rng.lock().unwrap().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.executor.auditor.rand("fill_bytes");
        self.executor.rng.lock().unwrap().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.executor.auditor.rand("try_fill_bytes");
        self.executor.rng.lock().unwrap().try_fill_bytes(dest)
    }
}

impl CryptoRng for Context {}
