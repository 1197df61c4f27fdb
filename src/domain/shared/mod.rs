//! Shared kernel - error and result types used by every layer

pub mod error;
pub mod result;

pub use error::SipError;
pub use result::Result;
