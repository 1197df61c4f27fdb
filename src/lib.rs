//! Sipper - a SIP user-agent client built with Rust
//!
//! Registers with a SIP provider over TCP using digest authentication
//! and notifies application listeners about inbound calls.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::SipConfiguration;
pub use domain::shared::error::SipError;
pub use domain::shared::result::Result;
pub use domain::RegistrationState;
pub use infrastructure::protocols::sip::{
    RegisteredSipConnection, SipClient, SipEventHandler, SipInviteEvent,
};
pub use infrastructure::shutdown::{close_on, install_shutdown_hook, ConnectionRegistry};
