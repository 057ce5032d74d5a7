use thiserror::Error;

/// Errors produced while setting up or running a bridge session.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("pty allocation failed: {0}")]
    Allocation(String),

    #[error("ble connect failed: {0}")]
    Connect(String),

    #[error("ble write failed: {0}")]
    Write(String),

    #[error("bluetooth adapter unavailable: {0}")]
    Adapter(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Process exit status for a setup failure of this kind.
    ///
    /// - `2`: adapter missing or access denied
    /// - `3`: target device not found or connect refused
    /// - `4`: no pseudo-terminal could be allocated
    /// - `1`: anything else
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Adapter(_) | BridgeError::PermissionDenied(_) => 2,
            BridgeError::Connect(_)
            | BridgeError::DeviceNotFound(_)
            | BridgeError::InvalidAddress(_) => 3,
            BridgeError::Allocation(_) => 4,
            _ => 1,
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_failures_have_distinct_exit_codes() {
        assert_eq!(BridgeError::PermissionDenied("hci0".into()).exit_code(), 2);
        assert_eq!(BridgeError::Adapter("none".into()).exit_code(), 2);
        assert_eq!(BridgeError::Connect("timeout".into()).exit_code(), 3);
        assert_eq!(BridgeError::DeviceNotFound("x".into()).exit_code(), 3);
        assert_eq!(BridgeError::Allocation("EAGAIN".into()).exit_code(), 4);
        assert_eq!(BridgeError::Other("?".into()).exit_code(), 1);
    }

    #[test]
    fn io_errors_convert() {
        let err: BridgeError = std::io::Error::other("broken pipe").into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
