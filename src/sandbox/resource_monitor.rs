//! Resource watchdog for a single sandboxed execution.
//!
//! A watcher thread polls elapsed time, memory growth and call depth while
//! the body runs. On a breach it records the error and raises a
//! cancellation flag; the body observes the flag at its checkpoints. The
//! watcher is stopped and joined on every exit path before the result is
//! inspected.

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval between watcher polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-execution ceilings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Seconds of wall-clock time
    #[serde(rename = "cpu_time_secs", alias = "cpu_time")]
    pub cpu_time: f64,
    /// Bytes of memory growth over the baseline
    #[serde(rename = "memory_bytes", alias = "memory")]
    pub memory: u64,
    /// Bytes of serialized output
    #[serde(rename = "output_size_bytes", alias = "output_size")]
    pub output_size: usize,
    pub stack_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: 5.0,
            memory: 100_000_000,
            output_size: 1_000_000,
            stack_depth: 100,
        }
    }
}

/// Source of memory readings.
///
/// `tracked` is the footprint the evaluator has reported through
/// [`ExecutionGuard::record_allocation`]; probes without an OS facility
/// fall back to it.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self, tracked: u64) -> u64;
}

/// Resident set size from `/proc/self/status`, or the tracked footprint
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    fn resident_bytes() -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self, tracked: u64) -> u64 {
        Self::resident_bytes().unwrap_or(tracked)
    }
}

/// Probe that only reports the tracked footprint
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackedMemoryProbe;

impl MemoryProbe for TrackedMemoryProbe {
    fn sample(&self, tracked: u64) -> u64 {
        tracked
    }
}

#[derive(Debug, Default)]
struct SharedState {
    cancelled: AtomicBool,
    breach: Mutex<Option<SandboxError>>,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    tracked: AtomicU64,
}

impl SharedState {
    fn trip(&self, error: SandboxError) {
        let mut slot = self.breach.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            warn!(error = %error, "resource limit breached, cancelling execution");
            *slot = Some(error);
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn breach(&self) -> Option<SandboxError> {
        self.breach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle given to the monitored body
#[derive(Debug)]
pub struct ExecutionGuard {
    state: Arc<SharedState>,
    stack_limit: usize,
}

impl ExecutionGuard {
    /// Fail with the watcher's error if the execution was cancelled
    pub fn checkpoint(&self) -> Result<(), SandboxError> {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return Err(self.state.breach().unwrap_or_else(|| {
                SandboxError::Resource("Execution cancelled by resource monitor".into())
            }));
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Enter one call frame; the frame is left when the scope drops
    pub fn enter(&self) -> Result<DepthScope<'_>, SandboxError> {
        self.checkpoint()?;
        let depth = self.state.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_depth.fetch_max(depth, Ordering::SeqCst);
        let scope = DepthScope {
            state: self.state.as_ref(),
        };
        if depth > self.stack_limit {
            let error = SandboxError::Resource(format!(
                "Stack depth limit exceeded: {depth} (limit: {})",
                self.stack_limit
            ));
            self.state.trip(error.clone());
            return Err(error);
        }
        Ok(scope)
    }

    pub fn record_allocation(&self, bytes: u64) {
        self.state.tracked.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .state
            .tracked
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

/// Call frame held open by [`ExecutionGuard::enter`]
#[derive(Debug)]
pub struct DepthScope<'a> {
    state: &'a SharedState,
}

impl Drop for DepthScope<'_> {
    fn drop(&mut self) {
        self.state.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What an execution consumed
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub elapsed_secs: f64,
    pub memory_bytes: u64,
    pub output_bytes: usize,
    pub peak_stack_depth: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Monitored<T> {
    pub value: T,
    pub usage: ResourceUsage,
}

/// Running watcher; stopping is idempotent and also happens on drop
struct Watcher {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("resource watcher panicked");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs a unit of work under [`ResourceLimits`]
#[derive(Clone)]
pub struct ResourceMonitor {
    probe: Arc<dyn MemoryProbe>,
    poll_interval: Duration,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::with_probe(Arc::new(ProcessMemoryProbe))
    }
}

impl ResourceMonitor {
    pub fn with_probe(probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run `body` under `limits`.
    ///
    /// A breach detected by the watcher wins over whatever the body
    /// returned, including a successful value.
    pub fn monitor<T, F>(&self, limits: &ResourceLimits, body: F) -> Result<Monitored<T>, SandboxError>
    where
        T: Serialize,
        F: FnOnce(&ExecutionGuard) -> Result<T, SandboxError>,
    {
        let state = Arc::new(SharedState::default());
        let start = Instant::now();
        let baseline = self.probe.sample(0);
        let mut watcher = self.spawn_watcher(Arc::clone(&state), *limits, start, baseline)?;

        let guard = ExecutionGuard {
            state: Arc::clone(&state),
            stack_limit: limits.stack_depth,
        };
        let result = body(&guard);

        watcher.stop();
        let elapsed_secs = start.elapsed().as_secs_f64();
        let memory_bytes = self
            .probe
            .sample(state.tracked.load(Ordering::Relaxed))
            .saturating_sub(baseline);

        if let Some(breach) = state.breach() {
            return Err(breach);
        }
        let value = result?;

        let output_bytes = serde_json::to_string(&value)
            .map(|s| s.len())
            .map_err(|e| SandboxError::runtime(format!("Result is not serializable: {e}")))?;
        if output_bytes > limits.output_size {
            return Err(SandboxError::Resource(format!(
                "Output size limit exceeded: {output_bytes} bytes (limit: {} bytes)",
                limits.output_size
            )));
        }

        debug!(elapsed_secs, memory_bytes, output_bytes, "monitored execution finished");
        Ok(Monitored {
            value,
            usage: ResourceUsage {
                elapsed_secs,
                memory_bytes,
                output_bytes,
                peak_stack_depth: state.peak_depth.load(Ordering::SeqCst),
            },
        })
    }

    fn spawn_watcher(
        &self,
        state: Arc<SharedState>,
        limits: ResourceLimits,
        start: Instant,
        baseline: u64,
    ) -> Result<Watcher, SandboxError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let probe = Arc::clone(&self.probe);
        let interval = self.poll_interval;

        let handle = std::thread::Builder::new()
            .name("sandbox-watcher".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > limits.cpu_time {
                    state.trip(SandboxError::Timeout {
                        elapsed,
                        limit: limits.cpu_time,
                    });
                    break;
                }

                let used = probe
                    .sample(state.tracked.load(Ordering::Relaxed))
                    .saturating_sub(baseline);
                if used > limits.memory {
                    state.trip(SandboxError::Resource(format!(
                        "Memory limit exceeded: {used} bytes (limit: {} bytes)",
                        limits.memory
                    )));
                    break;
                }

                let depth = state.depth.load(Ordering::SeqCst);
                if depth > limits.stack_depth {
                    state.trip(SandboxError::Resource(format!(
                        "Stack depth limit exceeded: {depth} (limit: {})",
                        limits.stack_depth
                    )));
                    break;
                }
            })
            .map_err(|e| SandboxError::Resource(format!("Failed to start resource watcher: {e}")))?;

        Ok(Watcher {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}
