use ipc_monitor::EngineError;
use poem::http::StatusCode;
use thiserror::Error;

use crate::lifecycle::LifecycleError;

/// Error kinds surfaced by the control endpoints.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("process {0} does not exist")]
    NoSuchProcess(i32),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::InvalidArg(_) => StatusCode::BAD_REQUEST,
            ControlError::NoSuchProcess(_) => StatusCode::NOT_FOUND,
            ControlError::Lifecycle(LifecycleError::Duplicate(_))
            | ControlError::Engine(EngineError::Duplicate(_)) => StatusCode::CONFLICT,
            ControlError::Lifecycle(LifecycleError::NotFound(_))
            | ControlError::Lifecycle(LifecycleError::NoSuchProcess(_))
            | ControlError::Engine(EngineError::NotFound(_)) => StatusCode::NOT_FOUND,
            ControlError::Engine(EngineError::NoCapacity)
            | ControlError::Engine(EngineError::AllocFailure) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<ControlError> for poem::Error {
    fn from(err: ControlError) -> Self {
        let status = err.status();
        poem::Error::from_string(err.to_string(), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ControlError::InvalidArg("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ControlError::Lifecycle(LifecycleError::Duplicate(1)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ControlError::Lifecycle(LifecycleError::NotFound(1)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ControlError::Engine(EngineError::NoCapacity).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
