use gpusub_mem::MemoryError;
use thiserror::Error;

/// Level-Zero style result codes surfaced to API callers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeResult {
    Success = 0,
    NotReady = 1,
    ErrorDeviceLost = 0x7000_0001,
    ErrorOutOfHostMemory = 0x7000_0002,
    ErrorOutOfDeviceMemory = 0x7000_0003,
    ErrorInvalidArgument = 0x7800_0004,
    ErrorHandleObjectInUse = 0x7800_0006,
    ErrorUnknown = 0x7fff_fffe,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("not ready")]
    NotReady,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("{0}")]
    Unknown(String),
}

impl SubmitError {
    pub fn ze_result(&self) -> ZeResult {
        match self {
            SubmitError::OutOfHostMemory => ZeResult::ErrorOutOfHostMemory,
            SubmitError::OutOfDeviceMemory => ZeResult::ErrorOutOfDeviceMemory,
            SubmitError::DeviceLost => ZeResult::ErrorDeviceLost,
            SubmitError::NotReady => ZeResult::NotReady,
            SubmitError::InvalidArgument(_) => ZeResult::ErrorInvalidArgument,
            SubmitError::InvalidState(_) => ZeResult::ErrorHandleObjectInUse,
            SubmitError::Unknown(_) => ZeResult::ErrorUnknown,
        }
    }
}

impl From<MemoryError> for SubmitError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfDeviceMemory => SubmitError::OutOfDeviceMemory,
            MemoryError::OutOfHostMemory => SubmitError::OutOfHostMemory,
            other => SubmitError::Unknown(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SubmitError>;

/// Collapse a call result into the code an API entry point would return.
pub fn ze_result_of<T>(res: &Result<T>) -> ZeResult {
    match res {
        Ok(_) => ZeResult::Success,
        Err(err) => err.ze_result(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("command_queue_buffer_count must be 2 or 3, got {0}")]
    BufferCount(usize),
    #[error("{0} must be non-zero")]
    ZeroSize(&'static str),
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_errors_map_onto_submit_errors() {
        assert_eq!(
            SubmitError::from(MemoryError::OutOfDeviceMemory),
            SubmitError::OutOfDeviceMemory
        );
        let err = SubmitError::from(MemoryError::BadGpuAddress { address: 0x10, len: 4 });
        assert_eq!(err.ze_result(), ZeResult::ErrorUnknown);
    }

    #[test]
    fn result_codes() {
        assert_eq!(ze_result_of(&Ok::<(), SubmitError>(())), ZeResult::Success);
        assert_eq!(
            ze_result_of::<()>(&Err(SubmitError::DeviceLost)),
            ZeResult::ErrorDeviceLost
        );
        assert_eq!(ZeResult::ErrorOutOfHostMemory as u32, 0x7000_0002);
    }
}
