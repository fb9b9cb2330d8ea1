//! Prometheus metrics for a regulated motor.
//!
//! Gauges mirror the latest published snapshot; counters follow the
//! regulator's running totals.

use motor_core::MotorSnapshot;
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Regulation loop
// ============================================================================

pub static TICKS_EXECUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "motor_ticks_executed_total",
        "Regulation loop ticks executed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static TICK_JITTER_US: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "motor_tick_jitter_us",
            "Lateness of regulation ticks in microseconds",
        )
        .buckets(vec![
            10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static STALLS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("motor_stalls_total", "Moves aborted by stall detection").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static DEVICE_FAULTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "motor_device_faults_total",
        "Device attribute failures seen by the regulation loop",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static TRANSITIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "motor_transitions_total",
        "State machine transitions delivered to listeners",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Motor state
// ============================================================================

pub static POSITION_DEG: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("motor_position_degrees", "Tachometer position in degrees").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static SPEED_DPS: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("motor_speed_dps", "Measured speed in degrees per second").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static COMMANDED_SPEED_DPS: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "motor_commanded_speed_dps",
        "Speed written to the device in degrees per second",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// 0=stopped, 1=moving, 2=holding, 3=stalled
pub static MODE: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "motor_mode",
        "Regulator mode (0=stopped,1=moving,2=holding,3=stalled)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Counter values already exported, so snapshot totals can be applied as deltas.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotRecorder {
    ticks: u64,
    stalls: u64,
    faults: u64,
}

impl SnapshotRecorder {
    pub fn record(&mut self, snapshot: &MotorSnapshot) {
        POSITION_DEG.set(snapshot.position);
        SPEED_DPS.set(snapshot.speed);
        COMMANDED_SPEED_DPS.set(snapshot.commanded_speed);
        MODE.set(i64::from(snapshot.mode.code()));
        TICK_JITTER_US.observe(f64::from(snapshot.cycle_jitter_us));

        TICKS_EXECUTED.inc_by(snapshot.tick_count.saturating_sub(self.ticks));
        STALLS.inc_by(snapshot.stall_count.saturating_sub(self.stalls));
        DEVICE_FAULTS.inc_by(snapshot.fault_count.saturating_sub(self.faults));
        self.ticks = self.ticks.max(snapshot.tick_count);
        self.stalls = self.stalls.max(snapshot.stall_count);
        self.faults = self.faults.max(snapshot.fault_count);
    }
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Serve `/metrics`, `/health` and `/ready` on `bind_addr` from a background thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match encode() {
                    Ok(buffer) => Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    ),
                    Err(e) => {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        Response::from_string("Internal Server Error").with_status_code(500)
                    }
                },
                "/health" => Response::from_string("OK"),
                "/ready" => {
                    if TICKS_EXECUTED.get() > 0 {
                        Response::from_string("Ready")
                    } else {
                        Response::from_string("Not Ready").with_status_code(503)
                    }
                }
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

pub fn encode() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Register every metric up front so the first scrape lists them all.
pub fn init_metrics() {
    let _ = TICKS_EXECUTED.get();
    let _ = TICK_JITTER_US.get_sample_count();
    let _ = STALLS.get();
    let _ = DEVICE_FAULTS.get();
    let _ = TRANSITIONS.get();
    let _ = POSITION_DEG.get();
    let _ = SPEED_DPS.get();
    let _ = COMMANDED_SPEED_DPS.get();
    let _ = MODE.get();
}
