//! Wire-format builders for the requests and replies this client sends

use super::auth::{nonce_count_hex, AuthenticationChallenge, AuthorizationResponse, QOP_AUTH};
use super::connection::ConnectionIdentity;
use super::handler::SipInviteEvent;
use super::message::SipMethod;
use crate::config::SipConfiguration;
use std::fmt::Write;

const CRLF: &str = "\r\n";

/// Fixed Via branch the registrars accept for this client
pub const VIA_BRANCH: &str = "z9hG4bK.8i7nkaF9s";

const SUPPORTED: &str = "replaces, outbound, gruu, path, record-aware";

/// Renders REGISTER variants and INVITE replies for one account
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    registrar: String,
    sip_id: String,
    user_agent: String,
    expires: u32,
}

impl MessageBuilder {
    pub fn new(
        registrar: impl Into<String>,
        sip_id: impl Into<String>,
        user_agent: impl Into<String>,
        expires: u32,
    ) -> Self {
        Self {
            registrar: registrar.into(),
            sip_id: sip_id.into(),
            user_agent: user_agent.into(),
            expires,
        }
    }

    pub fn from_config(config: &SipConfiguration) -> Self {
        Self::new(
            config.registrar.clone(),
            config.sip_id.clone(),
            config.user_agent.clone(),
            config.register_expires,
        )
    }

    /// `sip:<registrar>`, the request URI and digest URI of every REGISTER
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.registrar)
    }

    /// Unauthenticated REGISTER that provokes the 401 challenge
    pub fn register_preflight(&self, identity: &ConnectionIdentity, cseq: u32) -> String {
        self.register(identity, cseq, self.expires, None)
    }

    /// REGISTER carrying the digest `Authorization`
    pub fn login(&self, identity: &ConnectionIdentity, cseq: u32, authorization: &str) -> String {
        self.register(identity, cseq, self.expires, Some(authorization))
    }

    /// REGISTER with `Expires: 0`, reusing the cached authorization if any
    pub fn unregister(
        &self,
        identity: &ConnectionIdentity,
        cseq: u32,
        authorization: Option<&str>,
    ) -> String {
        self.register(identity, cseq, 0, authorization)
    }

    /// Value of the `Authorization` header (without the header name)
    pub fn authorization_value(
        &self,
        challenge: &AuthenticationChallenge,
        username: &str,
        response: &AuthorizationResponse,
        nonce_count: u32,
    ) -> String {
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm={}, username=\"{}\", uri=\"{}\", response=\"{}\", cnonce=\"{}\", nc={}, qop={}",
            challenge.realm,
            challenge.nonce,
            challenge.algorithm,
            username,
            self.registrar_uri(),
            response.response,
            response.client_nonce,
            nonce_count_hex(nonce_count),
            QOP_AUTH
        )
    }

    /// `SIP/2.0 486 Busy Here` for an inbound INVITE
    pub fn busy(&self, invite: &SipInviteEvent, tag: &str) -> String {
        self.invite_reply("486 Busy Here", invite, tag)
    }

    /// `SIP/2.0 180 Ringing` for an inbound INVITE
    pub fn ringing(&self, invite: &SipInviteEvent, tag: &str) -> String {
        self.invite_reply("180 Ringing", invite, tag)
    }

    fn register(
        &self,
        identity: &ConnectionIdentity,
        cseq: u32,
        expires: u32,
        authorization: Option<&str>,
    ) -> String {
        let method = SipMethod::Register;
        let local = identity.local_addr();
        let mut message = String::with_capacity(768);

        // write! into a String cannot fail
        let _ = write!(message, "{} {} SIP/2.0{}", method, self.registrar_uri(), CRLF);
        let _ = write!(message, "CSeq: {} {}{}", cseq, method, CRLF);
        let _ = write!(
            message,
            "Via: SIP/2.0/TCP {}:{};alias;branch={};rport{}",
            local.ip(),
            local.port(),
            VIA_BRANCH,
            CRLF
        );
        let _ = write!(
            message,
            "From: <sip:{}@{}>;tag={}{}",
            self.sip_id,
            self.registrar,
            identity.tag(),
            CRLF
        );
        let _ = write!(message, "To: sip:{}@{}{}", self.sip_id, self.registrar, CRLF);
        let _ = write!(message, "Call-ID: {}{}", identity.call_id(), CRLF);
        let _ = write!(message, "Max-Forwards: 70{}", CRLF);
        let _ = write!(message, "Supported: {}{}", SUPPORTED, CRLF);
        let _ = write!(
            message,
            "Contact: <sip:{}@{}:{};transport=tcp>{}",
            self.sip_id,
            identity.public_ip(),
            local.port(),
            CRLF
        );
        let _ = write!(message, "Expires: {}{}", expires, CRLF);
        let _ = write!(message, "User-Agent: {}{}", self.user_agent, CRLF);
        if let Some(authorization) = authorization {
            let _ = write!(message, "Authorization: {}{}", authorization, CRLF);
        }
        let _ = write!(message, "Content-Length: 0{}{}", CRLF, CRLF);

        message
    }

    fn invite_reply(&self, status: &str, invite: &SipInviteEvent, tag: &str) -> String {
        let mut message = String::with_capacity(512);

        let _ = write!(message, "SIP/2.0 {}{}", status, CRLF);
        let _ = write!(message, "Via: {}{}", invite.via, CRLF);
        let _ = write!(message, "From: {}{}", invite.from, CRLF);
        if invite.to.contains(";tag=") {
            let _ = write!(message, "To: {}{}", invite.to, CRLF);
        } else {
            let _ = write!(message, "To: {};tag={}{}", invite.to, tag, CRLF);
        }
        let _ = write!(message, "Call-ID: {}{}", invite.call_id, CRLF);
        let _ = write!(message, "CSeq: {} {}{}", invite.cseq, SipMethod::Invite, CRLF);
        let _ = write!(message, "User-Agent: {}{}", self.user_agent, CRLF);
        let _ = write!(message, "Content-Length: 0{}{}", CRLF, CRLF);

        message
    }
}
