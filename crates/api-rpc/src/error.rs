//! RPC Error Types
//!
//! Maps application errors to JSON-RPC error codes.

use eventjobs_core::error::AppError;
use jsonrpsee::types::ErrorObjectOwned;

/// RPC Error Codes
pub mod code {
    pub const VALIDATION_ERROR: i32 = 4000;
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4002;
    pub const REJECTED: i32 = 4004;
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const STORE_ERROR: i32 = 5001;
    pub const SYSTEM_ERROR: i32 = 5002;
}

/// Convert AppError to JSON-RPC ErrorObject
pub fn to_rpc_error(err: AppError) -> ErrorObjectOwned {
    match err {
        AppError::Validation(msg) => {
            ErrorObjectOwned::owned(code::VALIDATION_ERROR, msg, None::<()>)
        }
        AppError::NotFound(msg) => ErrorObjectOwned::owned(code::NOT_FOUND, msg, None::<()>),
        AppError::Conflict(msg) => ErrorObjectOwned::owned(code::CONFLICT, msg, None::<()>),
        AppError::InvalidState(msg) => ErrorObjectOwned::owned(code::CONFLICT, msg, None::<()>),
        AppError::Store(msg) | AppError::Unsupported(msg) => {
            ErrorObjectOwned::owned(code::STORE_ERROR, msg, None::<()>)
        }
        AppError::Domain(e) => {
            ErrorObjectOwned::owned(code::VALIDATION_ERROR, e.to_string(), None::<()>)
        }
        AppError::Serialization(e) => {
            ErrorObjectOwned::owned(code::VALIDATION_ERROR, e.to_string(), None::<()>)
        }
        AppError::Io(e) => ErrorObjectOwned::owned(code::SYSTEM_ERROR, e.to_string(), None::<()>),
        AppError::Config(msg) | AppError::Internal(msg) => {
            ErrorObjectOwned::owned(code::INTERNAL_ERROR, msg, None::<()>)
        }
    }
}

/// Submission refused; the messages travel as error data
pub fn rejected(errors: Vec<String>) -> ErrorObjectOwned {
    let message = errors
        .first()
        .cloned()
        .unwrap_or_else(|| "Job rejected".to_string());
    ErrorObjectOwned::owned(code::REJECTED, message, Some(errors))
}

pub fn job_not_found(job_id: &str) -> ErrorObjectOwned {
    to_rpc_error(AppError::NotFound(format!("Job {} not found", job_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            to_rpc_error(AppError::Conflict("x".into())).code(),
            code::CONFLICT
        );
        assert_eq!(
            to_rpc_error(AppError::Unsupported("x".into())).code(),
            code::STORE_ERROR
        );
        let err = rejected(vec!["Job topic is missing".into()]);
        assert_eq!(err.code(), code::REJECTED);
        assert_eq!(err.message(), "Job topic is missing");
        assert!(err.data().is_some());
    }
}
