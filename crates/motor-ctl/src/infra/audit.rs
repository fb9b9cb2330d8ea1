//! Audit trail of motor activity.
//!
//! Transitions arrive on the regulation thread, which must never wait on a
//! disk. [`AuditSink`] only enqueues; a dedicated writer thread owns the
//! file and appends one JSON object per line.

use motor_core::{MoveListener, TimeBase, TransitionEvent, TransitionReason};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// A command was handed to the motor.
    CommandIssued,
    /// A blocking command returned.
    CommandFinished,
    /// The regulator changed mode.
    Transition,
    /// The regulator stopped the motor after a device error.
    DeviceFault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Appends entries to a JSONL file.
pub struct AuditLogger {
    writer: BufWriter<File>,
}

impl AuditLogger {
    /// Opens in append mode so earlier runs are preserved.
    pub fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(8192, file),
        })
    }

    pub fn log(&mut self, entry: &AuditEntry) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Cloneable handle that queues entries for the writer thread.
#[derive(Clone)]
pub struct AuditSink {
    tx: Sender<AuditEntry>,
    timebase: TimeBase,
}

impl AuditSink {
    pub fn record(&self, timestamp_us: u64, event_type: AuditEventType, details: serde_json::Value) {
        let entry = AuditEntry {
            timestamp_us,
            unix_us: self.timebase.unix_us(),
            event_type,
            details,
        };
        // The writer only goes away during shutdown.
        let _ = self.tx.send(entry);
    }

    pub fn record_now(&self, event_type: AuditEventType, details: serde_json::Value) {
        self.record(self.timebase.now_us(), event_type, details);
    }

    /// Listener that records every transition.
    pub fn listener(&self) -> TransitionAudit {
        TransitionAudit { sink: self.clone() }
    }
}

/// Writer thread plus the sink feeding it.
pub struct AuditTrail {
    sink: AuditSink,
    writer: JoinHandle<u64>,
}

impl AuditTrail {
    pub fn start(path: &Path, timebase: TimeBase) -> io::Result<Self> {
        let mut logger = AuditLogger::new(path)?;
        let (tx, rx) = mpsc::channel::<AuditEntry>();
        let writer = thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || {
                let mut written = 0u64;
                for entry in rx {
                    match logger.log(&entry) {
                        Ok(()) => written += 1,
                        Err(e) => warn!(error = %e, "Failed to write audit entry"),
                    }
                }
                written
            })?;
        Ok(Self {
            sink: AuditSink { tx, timebase },
            writer,
        })
    }

    pub fn sink(&self) -> AuditSink {
        self.sink.clone()
    }

    /// Drain the queue and close the file. Entries queued through sinks
    /// that are still alive elsewhere keep the writer running until those
    /// sinks are dropped.
    pub fn finish(self) -> u64 {
        drop(self.sink);
        self.writer.join().unwrap_or_default()
    }
}

/// [`MoveListener`] writing transitions to the audit trail.
pub struct TransitionAudit {
    sink: AuditSink,
}

impl MoveListener for TransitionAudit {
    fn on_transition(&self, event: &TransitionEvent) {
        let (event_type, error) = match &event.reason {
            TransitionReason::Fault(err) => (AuditEventType::DeviceFault, Some(err.to_string())),
            _ => (AuditEventType::Transition, None),
        };
        let details = serde_json::json!({
            "previous": event.previous,
            "current": event.current,
            "position": event.position,
            "reason": reason_label(&event.reason),
            "error": error,
        });
        self.sink.record(event.timestamp_us, event_type, details);
    }
}

fn reason_label(reason: &TransitionReason) -> &'static str {
    match reason {
        TransitionReason::Command => "command",
        TransitionReason::TargetReached => "target_reached",
        TransitionReason::Stalled => "stalled",
        TransitionReason::Fault(_) => "fault",
    }
}
