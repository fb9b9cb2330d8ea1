use crate::motion::{MotionTarget, MotorMode};
use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Copy of the regulator's state, published after every tick and every
/// applied command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MotorSnapshot {
    pub timestamp_us: u64,
    pub tick_count: u64,
    pub position: f64,
    pub speed: f64,
    pub commanded_speed: f64,
    pub mode: MotorMode,
    pub target: Option<MotionTarget>,
    pub move_start_position: f64,
    /// Sequence number of the newest command the worker has consumed.
    pub applied_seq: u64,
    /// Sequence number of the command that produced the current motion.
    pub target_seq: u64,
    /// Whether the motion `target_seq` started has reached its goal.
    pub target_reached: bool,
    pub stall_count: u64,
    pub fault_count: u64,
    pub cycle_jitter_us: u32,
}

impl MotorSnapshot {
    pub fn tacho_count(&self) -> i32 {
        self.position.round() as i32
    }

    pub fn is_moving(&self) -> bool {
        self.mode == MotorMode::Moving
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingTarget {
    pub seq: u64,
    pub target: MotionTarget,
}

/// Everything a caller asked for since the worker last looked.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PendingCommands {
    pub target: Option<PendingTarget>,
    pub reset_tacho: Option<u64>,
    pub shutdown: bool,
}

impl PendingCommands {
    pub fn is_empty(&self) -> bool {
        self.target.is_none() && self.reset_tacho.is_none() && !self.shutdown
    }

    /// Stops and shutdown are handled as soon as they arrive; everything
    /// else waits for the next tick boundary.
    fn is_urgent(&self) -> bool {
        self.shutdown || self.target.map_or(false, |p| p.target.is_stop())
    }
}

#[derive(Debug, Default)]
struct CommandSlot {
    pending: PendingCommands,
    next_seq: u64,
    last_target_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitResult {
    Satisfied(MotorSnapshot),
    TimedOut(MotorSnapshot),
    WorkerGone(MotorSnapshot),
}

/// The only meeting point between caller threads and the regulation worker.
///
/// Callers write into a single command slot (last writer wins; sequence
/// numbers are assigned under the slot lock, so a dropped command always
/// has a smaller number than the one that replaced it). Motion targets are
/// picked up at tick boundaries, so two commands landing within one tick
/// resolve to exactly one; stops wake the worker immediately. The worker
/// publishes snapshots through an `ArcSwap`, readable without locking, and
/// bumps a generation counter that blocking waiters sleep on.
pub struct MotorExchange {
    slot: Mutex<CommandSlot>,
    command_ready: Condvar,
    snapshot: ArcSwap<MotorSnapshot>,
    generation: Mutex<u64>,
    published: Condvar,
    worker_alive: AtomicBool,
}

impl MotorExchange {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(CommandSlot::default()),
            command_ready: Condvar::new(),
            snapshot: ArcSwap::from_pointee(MotorSnapshot::default()),
            generation: Mutex::new(0),
            published: Condvar::new(),
            worker_alive: AtomicBool::new(false),
        }
    }

    /// Called by caller threads. Replaces any target not yet consumed.
    pub fn submit_target(&self, target: MotionTarget) -> u64 {
        let mut slot = self.slot.lock();
        slot.next_seq += 1;
        let seq = slot.next_seq;
        slot.last_target_seq = seq;
        if let Some(dropped) = slot.pending.target.replace(PendingTarget { seq, target }) {
            log::debug!(
                "target seq={} superseded before it was applied (by seq={})",
                dropped.seq,
                seq
            );
        }
        if target.is_stop() {
            self.command_ready.notify_one();
        }
        seq
    }

    /// Sequence number of the most recently submitted target.
    pub fn last_target_seq(&self) -> u64 {
        self.slot.lock().last_target_seq
    }

    pub fn request_tacho_reset(&self) -> u64 {
        let mut slot = self.slot.lock();
        slot.next_seq += 1;
        let seq = slot.next_seq;
        slot.pending.reset_tacho = Some(seq);
        seq
    }

    pub fn request_shutdown(&self) {
        let mut slot = self.slot.lock();
        slot.pending.shutdown = true;
        self.command_ready.notify_one();
    }

    /// Called by the worker: sleep until `deadline` or until a stop or
    /// shutdown is posted, then take whatever is pending.
    pub fn wait_for_commands(&self, deadline: Instant) -> PendingCommands {
        let mut slot = self.slot.lock();
        while !slot.pending.is_urgent() {
            if self.command_ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut slot.pending)
    }

    /// Take pending commands without sleeping.
    pub fn take_commands(&self) -> PendingCommands {
        std::mem::take(&mut self.slot.lock().pending)
    }

    /// Called by the worker after every tick and applied command.
    pub fn publish(&self, snapshot: MotorSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
        *self.generation.lock() += 1;
        self.published.notify_all();
    }

    pub fn snapshot(&self) -> MotorSnapshot {
        **self.snapshot.load()
    }

    pub fn set_worker_alive(&self, alive: bool) {
        self.worker_alive.store(alive, Ordering::Release);
        *self.generation.lock() += 1;
        self.published.notify_all();
    }

    pub fn worker_alive(&self) -> bool {
        self.worker_alive.load(Ordering::Acquire)
    }

    /// Block until a published snapshot satisfies `done`, the deadline
    /// passes, or the worker exits.
    pub fn wait_until<F>(&self, deadline: Instant, mut done: F) -> WaitResult
    where
        F: FnMut(&MotorSnapshot) -> bool,
    {
        let mut generation = self.generation.lock();
        loop {
            let snapshot = self.snapshot();
            if done(&snapshot) {
                return WaitResult::Satisfied(snapshot);
            }
            if !self.worker_alive() {
                return WaitResult::WorkerGone(snapshot);
            }
            if self.published.wait_until(&mut generation, deadline).timed_out() {
                let snapshot = self.snapshot();
                return if done(&snapshot) {
                    WaitResult::Satisfied(snapshot)
                } else {
                    WaitResult::TimedOut(snapshot)
                };
            }
        }
    }
}

impl Default for MotorExchange {
    fn default() -> Self {
        Self::new()
    }
}
