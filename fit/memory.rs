//! Peak resident-memory tracking for a whole run.
//!
//! A dedicated thread polls a [`MemoryProbe`] on a fixed cadence and keeps the largest
//! reading in an atomic register. The sampler is the only writer; readers look at the
//! value after `stop()` has joined the thread.

use crate::types::MemoryUnit;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("The memory sampler is already running.")]
    AlreadyRunning,
    #[error("Could not determine the current process id: {0}")]
    CurrentPid(String),
    #[error("Failed to spawn the memory sampling thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A source of resident-memory readings.
pub trait MemoryProbe: Send + 'static {
    /// Resident bytes of the target, or `None` once the target no longer exists.
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Reads resident memory of a process, and optionally of all its live descendants,
/// through `sysinfo`.
pub struct SysinfoProbe {
    system: System,
    target: Pid,
    include_descendants: bool,
}

impl SysinfoProbe {
    pub fn new(target: Pid, include_descendants: bool) -> Self {
        Self {
            system: System::new(),
            target,
            include_descendants,
        }
    }

    pub fn current_process(include_descendants: bool) -> Result<Self, SamplerError> {
        let pid = sysinfo::get_current_pid().map_err(|e| SamplerError::CurrentPid(e.to_string()))?;
        Ok(Self::new(pid, include_descendants))
    }

    fn descendant_bytes(&self) -> u64 {
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            // Threads show up as tasks sharing the parent's address space.
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut total = 0u64;
        let mut queue: VecDeque<Pid> = children.get(&self.target).cloned().unwrap_or_default().into();
        while let Some(pid) = queue.pop_front() {
            // A descendant may exit between enumeration and the read.
            let Some(process) = self.system.process(pid) else {
                continue;
            };
            total = total.saturating_add(process.memory());
            if let Some(grandchildren) = children.get(&pid) {
                queue.extend(grandchildren.iter().copied());
            }
        }
        total
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&mut self) -> Option<u64> {
        let to_update = if self.include_descendants {
            ProcessesToUpdate::All
        } else {
            ProcessesToUpdate::Some(std::slice::from_ref(&self.target))
        };
        self.system.refresh_processes_specifics(
            to_update,
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        let own = self.system.process(self.target)?.memory();
        if self.include_descendants {
            Some(own.saturating_add(self.descendant_bytes()))
        } else {
            Some(own)
        }
    }
}

struct RunningSampler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Background sampler of peak resident memory.
pub struct MemorySampler {
    interval: Duration,
    unit: MemoryUnit,
    peak: Arc<AtomicU64>,
    running: Option<RunningSampler>,
}

impl MemorySampler {
    pub fn new(interval: Duration, unit: MemoryUnit) -> Self {
        Self {
            interval,
            unit,
            peak: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    /// Starts sampling the current process, including its descendants if requested.
    pub fn start_current_process(&mut self, include_descendants: bool) -> Result<(), SamplerError> {
        let probe = SysinfoProbe::current_process(include_descendants)?;
        self.start(probe)
    }

    pub fn start<P: MemoryProbe>(&mut self, mut probe: P) -> Result<(), SamplerError> {
        if self.running.is_some() {
            return Err(SamplerError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let peak = Arc::clone(&self.peak);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("memory-sampler".to_string())
            .spawn(move || {
                loop {
                    match probe.resident_bytes() {
                        Some(bytes) => {
                            peak.fetch_max(bytes, Ordering::Relaxed);
                        }
                        None => {
                            log::debug!("Memory sampler target exited; sampling stopped");
                            break;
                        }
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        self.running = Some(RunningSampler { stop_tx, handle });
        Ok(())
    }

    /// Signals the sampling loop and waits for it to exit. A no-op when the sampler
    /// was never started or has already been stopped.
    pub fn stop(&mut self) {
        let Some(RunningSampler { stop_tx, handle }) = self.running.take() else {
            return;
        };
        // The loop may already have exited on its own, in which case nobody listens.
        let _ = stop_tx.try_send(());
        drop(stop_tx);
        if handle.join().is_err() {
            log::warn!("Memory sampling thread panicked; the peak reading may be incomplete");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Peak reading converted to the configured unit.
    pub fn peak(&self) -> f64 {
        self.unit.convert(self.peak_bytes())
    }

    pub fn unit(&self) -> MemoryUnit {
        self.unit
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.stop();
    }
}
