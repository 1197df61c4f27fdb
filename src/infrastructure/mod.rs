//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP client engine
//! - DNS and public IP collaborators
//! - Process shutdown handling

pub mod net;
pub mod protocols;
pub mod shutdown;
