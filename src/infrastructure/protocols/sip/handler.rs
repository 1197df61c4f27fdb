//! Application-facing event handlers

use super::connection::RegisteredSipConnection;
use super::message::{parse_decimal, RawMessage, SipMethod};
use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Details of an inbound INVITE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipInviteEvent {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub cseq: u32,
    pub via: String,
}

impl TryFrom<&RawMessage> for SipInviteEvent {
    type Error = SipError;

    fn try_from(message: &RawMessage) -> Result<Self> {
        if !message.is_method(SipMethod::Invite) {
            return Err(SipError::MalformedMessage(format!(
                "not an INVITE: {}",
                message.start_line()
            )));
        }

        let cseq_value = message.header("CSeq").unwrap_or_default().trim();
        let cseq = cseq_value
            .split(' ')
            .next()
            .and_then(parse_decimal)
            .ok_or_else(|| {
                SipError::MalformedMessage(format!("Message did not have valid cseq: {}", cseq_value))
            })?;

        Ok(Self {
            call_id: message.header("Call-ID").unwrap_or_default().to_string(),
            from: message.header("From").unwrap_or_default().to_string(),
            to: message.header("To").unwrap_or_default().to_string(),
            cseq,
            via: message.header("Via").unwrap_or_default().to_string(),
        })
    }
}

/// Listener for unsolicited inbound events on a registered connection
///
/// Errors returned here (and panics) are logged by the dispatcher and never
/// reach the connection or other listeners.
#[async_trait]
pub trait SipEventHandler: Send + Sync {
    /// Called once per inbound INVITE
    async fn on_ring(
        &self,
        connection: RegisteredSipConnection,
        invite: SipInviteEvent,
    ) -> anyhow::Result<()>;
}
