use crate::instance::AdapterLuid;

/// Coarse classification of a [`RenderError`].
///
/// Callers that only need to decide between "retry on another adapter",
/// "recover with `set_adapter`" and "give up" can match on this instead of
/// the full error.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorStatus {
    NoSuitableAdapter,
    DeviceCreationFailed,
    DeviceRemoved,
    ResourceExhausted,
    SurfaceError,
    InvalidState,
    StaleResource,
    Backend,
}

/// Error type shared by every fallible operation in this crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    /// Every selection candidate was exhausted.
    #[error("no suitable adapter: {0}")]
    NoSuitableAdapter(String),

    /// An explicitly requested adapter is not enumerated by the instance.
    #[error("adapter {0} not found")]
    AdapterNotFound(AdapterLuid),

    /// A single adapter could not produce a device at the requested level.
    #[error("failed to create device on `{adapter}`: {reason}")]
    DeviceCreationFailed { adapter: String, reason: String },

    #[error("device removed: {0}")]
    DeviceRemoved(String),

    #[error("{resource} exhausted (capacity {capacity})")]
    ResourceExhausted {
        resource: &'static str,
        capacity: u32,
    },

    #[error("surface error: {0}")]
    Surface(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A command referenced an object created by a different device.
    #[error("resource `{name}` belongs to device epoch {resource_epoch}, current epoch is {device_epoch}")]
    StaleResource {
        name: String,
        resource_epoch: u64,
        device_epoch: u64,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl RenderError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            RenderError::NoSuitableAdapter(_) | RenderError::AdapterNotFound(_) => {
                ErrorStatus::NoSuitableAdapter
            }
            RenderError::DeviceCreationFailed { .. } => ErrorStatus::DeviceCreationFailed,
            RenderError::DeviceRemoved(_) => ErrorStatus::DeviceRemoved,
            RenderError::ResourceExhausted { .. } => ErrorStatus::ResourceExhausted,
            RenderError::Surface(_) => ErrorStatus::SurfaceError,
            RenderError::InvalidState(_) => ErrorStatus::InvalidState,
            RenderError::StaleResource { .. } => ErrorStatus::StaleResource,
            RenderError::Backend(_) => ErrorStatus::Backend,
        }
    }

    /// Returns true when the error means the active device is gone.
    pub fn is_device_removed(&self) -> bool {
        self.status() == ErrorStatus::DeviceRemoved
    }
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// High-level response after a window surface acquisition error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SurfaceErrorAction {
    /// Surface was reconfigured; presentation may be retried.
    Reconfigured,
    /// Transient error; skip presenting this frame.
    SkipFrame,
    /// Fatal error (commonly OOM).
    Fatal,
}
