//! Client result type

use super::error::SipError;

/// Standard result type for client operations
pub type Result<T> = std::result::Result<T, SipError>;
