use motor_core::{MotorSnapshot, TransitionEvent};
use motor_io::metrics::{init_metrics, serve_metrics, SnapshotRecorder, TRANSITIONS};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_PERIOD: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Copy snapshots into the gauges until `stop` is set.
pub fn start_metrics_updater<F>(snapshot: F, stop: Arc<AtomicBool>) -> thread::JoinHandle<()>
where
    F: Fn() -> MotorSnapshot + Send + 'static,
{
    thread::spawn(move || {
        let mut recorder = SnapshotRecorder::default();
        while !stop.load(Ordering::Relaxed) {
            recorder.record(&snapshot());
            thread::sleep(UPDATE_PERIOD);
        }
        recorder.record(&snapshot());
    })
}

/// Listener counting transitions. Cheap enough for the regulation thread.
pub fn count_transition(_event: &TransitionEvent) {
    TRANSITIONS.inc();
}
