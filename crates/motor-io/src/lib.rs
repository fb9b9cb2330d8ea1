pub mod metrics;
pub mod sysfs;

pub use metrics::{init_metrics, serve_metrics, SnapshotRecorder};
pub use sysfs::{
    find_device, AttributeDir, SysfsModeSelector, SysfsMotor, LEGO_SENSOR_CLASS,
    TACHO_MOTOR_CLASS,
};
