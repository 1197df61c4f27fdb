//! Correlation matchers - single-use waiters for a specific handshake reply
//!
//! A matcher scans the router queue, removes the first message it accepts
//! and converts it. Between scans it sleeps until the router signals a new
//! arrival or the poll interval elapses, whichever comes first.

use super::auth::AuthenticationChallenge;
use super::message::{RawMessage, SipMethod};
use super::router::MessageRouter;
use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Re-scan interval when no arrival is signalled
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub trait MessageMatcher {
    type Output;

    /// What the matcher waits for, used in timeout errors
    fn awaiting(&self) -> &'static str;

    fn matches(&self, message: &RawMessage) -> bool;

    /// Convert the matched message; consumes the matcher
    fn accept(self, message: RawMessage) -> Result<Self::Output>;
}

/// Wait until a queued message satisfies `matcher`, remove it and convert it.
///
/// Fails with `HandshakeTimeout` after `timeout` and with `Cancelled` as soon
/// as `cancel` fires.
pub async fn await_match<M: MessageMatcher>(
    router: &MessageRouter,
    matcher: M,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<M::Output> {
    let awaiting = matcher.awaiting();

    let wait = async {
        loop {
            let arrived = router.arrived();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(message) = router.take_first(|m| matcher.matches(m)) {
                return Ok(message);
            }

            if router.is_closed() {
                return Err(SipError::Cancelled(format!(
                    "connection closed while waiting for {}",
                    awaiting
                )));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SipError::Cancelled(format!(
                        "interrupted while waiting for {}",
                        awaiting
                    )));
                }
                _ = &mut arrived => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    };

    let message = tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| SipError::HandshakeTimeout { awaiting, timeout })??;

    debug!("Matched {}: {}", awaiting, message.start_line());
    matcher.accept(message)
}

fn is_register_response(message: &RawMessage, cseq: u32) -> bool {
    message.is_response() && message.is_method(SipMethod::Register) && message.cseq() == Some(cseq)
}

/// Waits for the `401 Unauthorized` answering the preflight REGISTER
#[derive(Debug, Clone)]
pub struct ChallengeMatcher {
    cseq: u32,
}

impl ChallengeMatcher {
    pub fn new(cseq: u32) -> Self {
        Self { cseq }
    }
}

impl MessageMatcher for ChallengeMatcher {
    type Output = AuthenticationChallenge;

    fn awaiting(&self) -> &'static str {
        "401 Unauthorized"
    }

    fn matches(&self, message: &RawMessage) -> bool {
        is_register_response(message, self.cseq) && message.status_code() == Some(401)
    }

    fn accept(self, message: RawMessage) -> Result<AuthenticationChallenge> {
        info!("Parsing message: [{}]", message.start_line());
        let header = message.header("WWW-Authenticate").ok_or_else(|| {
            SipError::MalformedMessage(
                "no line starts with 'WWW-Authenticate: '".to_string(),
            )
        })?;

        let challenge = AuthenticationChallenge::parse(header)?;
        info!("Auth request: realm={} algorithm={}", challenge.realm, challenge.algorithm);
        Ok(challenge)
    }
}

/// Waits for the final reply to a REGISTER; anything but `200 OK` is a rejection
#[derive(Debug, Clone)]
pub struct LoginMatcher {
    cseq: u32,
}

impl LoginMatcher {
    pub fn new(cseq: u32) -> Self {
        Self { cseq }
    }
}

impl MessageMatcher for LoginMatcher {
    type Output = ();

    fn awaiting(&self) -> &'static str {
        "final REGISTER reply"
    }

    fn matches(&self, message: &RawMessage) -> bool {
        is_register_response(message, self.cseq)
            && message.status_code().map_or(false, |status| status >= 200)
    }

    fn accept(self, message: RawMessage) -> Result<()> {
        if message.status_code() == Some(200) {
            return Ok(());
        }

        Err(SipError::LoginRejected(message.start_line().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // CSeq sits inside the header block; after the blank line the framer drops it
    const CHALLENGE: &str = "SIP/2.0 401 Unauthorized\n\
                             WWW-Authenticate: Digest realm=\"r\", nonce=\"n\", algorithm=MD5, qop=\"auth\"\n\
                             CSeq: 10 REGISTER\n\n";

    fn message(text: &str) -> RawMessage {
        RawMessage::parse(text).unwrap()
    }

    #[tokio::test]
    async fn test_challenge_matcher_extracts_challenge() {
        let router = MessageRouter::new();
        router.route(message(CHALLENGE));

        let challenge = await_match(
            &router,
            ChallengeMatcher::new(10),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(challenge.realm, "r");
        assert_eq!(challenge.nonce, "n");
        assert_eq!(challenge.algorithm, "MD5");
        assert_eq!(challenge.qop, "auth");
        assert!(router.get_messages().is_empty());
    }

    #[tokio::test]
    async fn test_matcher_waits_for_late_arrival() {
        let router = Arc::new(MessageRouter::new());
        let sender = router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender.route(message("SIP/2.0 100 Trying\nCSeq: 11 REGISTER\n\n"));
            sender.route(message("SIP/2.0 200 OK\nCSeq: 11 REGISTER\n\n"));
        });

        let result = await_match(
            &router,
            LoginMatcher::new(11),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_ok());
        // provisional reply stays queued
        assert_eq!(router.get_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_matcher_ignores_other_cseq() {
        let router = MessageRouter::new();
        router.route(message("SIP/2.0 200 OK\nCSeq: 99 REGISTER\n\n"));

        let err = await_match(
            &router,
            LoginMatcher::new(11),
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SipError::HandshakeTimeout { .. }));
        assert_eq!(router.get_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let router = MessageRouter::new();
        router.route(message("SIP/2.0 403 Forbidden\nCSeq: 11 REGISTER\n\n"));

        let err = await_match(
            &router,
            LoginMatcher::new(11),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SipError::LoginRejected(ref line) if line == "SIP/2.0 403 Forbidden"));
    }

    #[tokio::test]
    async fn test_timeout_when_no_challenge_arrives() {
        let router = MessageRouter::new();

        let err = await_match(
            &router,
            ChallengeMatcher::new(10),
            Duration::from_millis(250),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            SipError::HandshakeTimeout { awaiting: "401 Unauthorized", .. }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_ends_wait_promptly() {
        let router = MessageRouter::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = await_match(&router, ChallengeMatcher::new(10), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SipError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_challenge_without_header_is_malformed() {
        let router = MessageRouter::new();
        router.route(message("SIP/2.0 401 Unauthorized\nCSeq: 10 REGISTER\n\n"));

        let err = await_match(
            &router,
            ChallengeMatcher::new(10),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SipError::MalformedMessage(_)));
    }
}
