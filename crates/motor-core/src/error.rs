use thiserror::Error;

/// Failure to access one of the actuator's device attributes.
///
/// Carries the attribute name so a log line or listener can say which file
/// went away. Cloneable so the same fault can be handed to every listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceIoError {
    #[error("attribute `{attribute}` unavailable: {reason}")]
    Unavailable { attribute: String, reason: String },
    #[error("permission denied on attribute `{attribute}`")]
    PermissionDenied { attribute: String },
    #[error("malformed content in attribute `{attribute}`: {content:?}")]
    Malformed { attribute: String, content: String },
}

impl DeviceIoError {
    pub fn unavailable(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(attribute: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Malformed {
            attribute: attribute.into(),
            content: content.into(),
        }
    }

    pub fn attribute(&self) -> &str {
        match self {
            Self::Unavailable { attribute, .. }
            | Self::PermissionDenied { attribute }
            | Self::Malformed { attribute, .. } => attribute,
        }
    }
}

/// Errors returned synchronously by the [`RegulatedMotor`](crate::RegulatedMotor) facade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotorError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("speed {requested} deg/s outside 0..={limit} deg/s")]
    SpeedOutOfRange { requested: f64, limit: f64 },
    #[error(transparent)]
    Device(#[from] DeviceIoError),
    #[error("regulation worker is not running")]
    WorkerUnavailable,
    #[error("failed to start regulation worker: {0}")]
    Spawn(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mode `{requested}` unavailable (supported: {})", available.join(", "))]
pub struct ModeUnavailableError {
    pub requested: String,
    pub available: Vec<String>,
}
