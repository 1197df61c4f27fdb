//! Domain layer - protocol-independent types
//!
//! This layer contains:
//! - The registration lifecycle state machine
//! - Shared error and result types

pub mod registration;
pub mod shared;

// Re-export commonly used types
pub use registration::RegistrationState;
pub use shared::{Result, SipError};
