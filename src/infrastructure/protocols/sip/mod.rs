//! SIP user-agent client over TCP
//!
//! ```text
//! ┌─────────────────────────┐
//! │  client (orchestrator)  │──── builder, auth
//! └───────────┬─────────────┘
//!             │ matcher
//! ┌───────────▼─────────────┐
//! │   router (queue, INVITE │──── handler (listeners)
//! │   fan-out)              │
//! └───────────▲─────────────┘
//!             │
//! ┌───────────┴─────────────┐
//! │   framer (reader task)  │──── message
//! └───────────▲─────────────┘
//!             │
//!        connection (TCP)
//! ```

pub mod auth;
pub mod builder;
pub mod client;
pub mod connection;
pub mod framer;
pub mod handler;
pub mod matcher;
pub mod message;
pub mod router;

pub use auth::{AuthenticationChallenge, AuthorizationResponse, DigestAlgorithm, DigestAuthenticator};
pub use builder::MessageBuilder;
pub use client::SipClient;
pub use connection::{ConnectionIdentity, RegisteredSipConnection};
pub use framer::{frame_messages, SipFramer};
pub use handler::{SipEventHandler, SipInviteEvent};
pub use matcher::{await_match, ChallengeMatcher, LoginMatcher, MessageMatcher};
pub use message::{Headers, RawMessage, SipMethod};
pub use router::MessageRouter;
