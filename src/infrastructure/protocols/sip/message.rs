//! Raw SIP message model and header-block parsing

use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use std::fmt;

/// Status-line prefix of every SIP response
pub const SIP_VERSION_PREFIX: &str = "SIP/2.0 ";

/// SIP method names used by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Header map that keeps first-insertion order; a repeated name keeps the last value.
///
/// Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One framed SIP message as received on the wire
///
/// `method` comes from the second token of the `CSeq` header, not from the
/// request line, so responses carry the method of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    header_block: String,
    method: String,
    headers: Headers,
    body: String,
}

impl RawMessage {
    /// Parse a header block without body
    pub fn parse(header_block: impl Into<String>) -> Result<Self> {
        Self::with_body(header_block, String::new())
    }

    /// Parse a header block and attach the body read after it
    pub fn with_body(header_block: impl Into<String>, body: impl Into<String>) -> Result<Self> {
        let header_block = header_block.into();
        let method = parse_method(&header_block)?;
        let headers = parse_headers(&header_block);

        Ok(Self {
            header_block,
            method,
            headers,
            body: body.into(),
        })
    }

    pub fn header_block(&self) -> &str {
        &self.header_block
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_method(&self, method: SipMethod) -> bool {
        self.method == method.as_str()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Request line or status line
    pub fn start_line(&self) -> &str {
        self.header_block.lines().next().unwrap_or_default()
    }

    pub fn is_response(&self) -> bool {
        self.header_block.starts_with(SIP_VERSION_PREFIX)
    }

    /// Status code of a response, `None` for requests
    pub fn status_code(&self) -> Option<u16> {
        self.start_line()
            .strip_prefix(SIP_VERSION_PREFIX)?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    /// Sequence number of the `CSeq` header
    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|cseq| cseq.split_whitespace().next())
            .and_then(parse_decimal)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }
}

impl fmt::Display for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.header_block, self.body)
    }
}

/// Parse a decimal integer; leading zeros are decimal, hex and signs are rejected
pub fn parse_decimal(value: &str) -> Option<u32> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn parse_method(header_block: &str) -> Result<String> {
    let cseq_line = header_block
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("cseq:"))
        .ok_or_else(|| SipError::MalformedMessage("no CSeq header".to_string()))?;

    cseq_line
        .split(' ')
        .nth(2)
        .map(|method| method.trim().to_string())
        .filter(|method| !method.is_empty())
        .ok_or_else(|| SipError::MalformedMessage(format!("CSeq without method: {}", cseq_line)))
}

fn parse_headers(header_block: &str) -> Headers {
    let mut headers = Headers::new();
    for line in header_block.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name, value.trim());
        }
    }
    headers
}
