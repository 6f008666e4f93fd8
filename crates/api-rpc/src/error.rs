//! RPC Error Types
//!
//! Maps application errors to JSON-RPC error codes.

use jsonrpsee::types::ErrorObjectOwned;
use scanfleet_core::domain::DomainError;
use scanfleet_core::error::AppError;
use tracing::error;

/// RPC Error Codes
pub mod code {
    pub const VALIDATION_ERROR: i32 = 4000;
    pub const NOT_FOUND: i32 = 4004;
    pub const CONFLICT: i32 = 4009;
    pub const INTERNAL_ERROR: i32 = 5000;
}

/// Convert AppError to JSON-RPC ErrorObject
pub fn to_rpc_error(err: AppError) -> ErrorObjectOwned {
    let code = match &err {
        AppError::Validation(_) | AppError::Serialization(_) => code::VALIDATION_ERROR,
        AppError::Domain(DomainError::InvalidStateTransition { .. }) => code::CONFLICT,
        AppError::Domain(_) => code::VALIDATION_ERROR,
        AppError::NotFound(_) => code::NOT_FOUND,
        AppError::Conflict(_) => code::CONFLICT,
        _ => {
            error!(error = %err, "RPC call failed");
            code::INTERNAL_ERROR
        }
    };
    ErrorObjectOwned::owned(code, err.to_string(), None::<()>)
}

pub fn validation(msg: impl Into<String>) -> ErrorObjectOwned {
    to_rpc_error(AppError::Validation(msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(to_rpc_error(AppError::Validation("x".into())).code(), 4000);
        assert_eq!(to_rpc_error(AppError::NotFound("x".into())).code(), 4004);
        assert_eq!(to_rpc_error(AppError::Conflict("x".into())).code(), 4009);
        assert_eq!(to_rpc_error(AppError::Database("x".into())).code(), 5000);
        assert_eq!(
            to_rpc_error(AppError::Domain(DomainError::ValidationError("x".into()))).code(),
            4000
        );
        assert_eq!(
            to_rpc_error(AppError::Domain(DomainError::InvalidStateTransition {
                from: "completed".into(),
                to: "in-progress".into(),
            }))
            .code(),
            4009
        );
    }
}
