//! Registration lifecycle state machine

use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registration state of a single connection
///
/// The happy path runs top to bottom. Every state may fall through to
/// `Closed` when the attempt fails or the connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    /// No socket yet
    Disconnected,
    /// TCP connection established
    SocketOpen,
    /// Unauthenticated REGISTER written
    PreflightSent,
    /// 401 challenge received and parsed
    ChallengeReceived,
    /// Authenticated REGISTER written
    LoginSent,
    /// Registrar answered 200 OK
    Registered,
    /// Un-REGISTER written, waiting out the grace period
    Unregistering,
    /// Socket closed
    Closed,
}

impl RegistrationState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &RegistrationState) -> bool {
        use RegistrationState::*;

        match (self, new_state) {
            (Disconnected, SocketOpen) => true,
            (SocketOpen, PreflightSent) => true,
            (PreflightSent, ChallengeReceived) => true,
            (ChallengeReceived, LoginSent) => true,
            (LoginSent, Registered) => true,
            (Registered, Unregistering) => true,
            (Unregistering, Closed) => true,

            // Failure paths converge on Closed
            (Closed, _) => false,
            (_, Closed) => true,

            _ => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Registered)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationState::Closed)
    }

    /// Validate and return the next state
    pub fn transition(self, new_state: RegistrationState) -> Result<RegistrationState> {
        if !self.can_transition_to(&new_state) {
            return Err(SipError::InvalidStateTransition(format!(
                "Cannot transition from {} to {}",
                self, new_state
            )));
        }

        Ok(new_state)
    }
}

impl Default for RegistrationState {
    fn default() -> Self {
        RegistrationState::Disconnected
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Disconnected => "disconnected",
            RegistrationState::SocketOpen => "socket-open",
            RegistrationState::PreflightSent => "preflight-sent",
            RegistrationState::ChallengeReceived => "challenge-received",
            RegistrationState::LoginSent => "login-sent",
            RegistrationState::Registered => "registered",
            RegistrationState::Unregistering => "unregistering",
            RegistrationState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}
