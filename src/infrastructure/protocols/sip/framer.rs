//! Stream framer - turns a TCP byte stream into discrete SIP messages
//!
//! Lines are accumulated until a blank line closes the header block. An
//! `INVITE` that declares a nonzero `Content-Length` is followed by exactly
//! that many bytes of body; every other message ends at the blank line.
//!
//! Messages that cannot be parsed are dropped with a warning and framing
//! carries on with the next line.

use super::message::{RawMessage, SipMethod};
use super::router::MessageRouter;
use crate::domain::shared::error::SipError;
use crate::domain::shared::result::Result;
use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Upper bound for a header block or a declared body
pub const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Header block waiting for its body bytes
#[derive(Debug)]
struct PendingBody {
    header_block: String,
    length: usize,
}

/// Line-oriented SIP framer usable with `FramedRead`
#[derive(Debug, Default)]
pub struct SipFramer {
    accumulated: String,
    pending: Option<PendingBody>,
}

enum Completed {
    Message(RawMessage),
    AwaitingBody,
    Dropped,
}

impl SipFramer {
    pub fn new() -> Self {
        Self::default()
    }

    fn complete_header_block(&mut self, header_block: String) -> Completed {
        let message = match RawMessage::parse(header_block.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable header block: {}", e);
                trace!("Dropped header block:\n[{}]", header_block);
                return Completed::Dropped;
            }
        };

        if !message.is_method(SipMethod::Invite) {
            return Completed::Message(message);
        }

        let length = match message.header("Content-Length") {
            None => return Completed::Message(message),
            Some(value) => match value.trim().parse::<usize>() {
                Ok(length) => length,
                Err(_) => {
                    warn!(
                        "Dropping INVITE: Content-Length is not a number: {:?}",
                        value
                    );
                    return Completed::Dropped;
                }
            },
        };

        if length == 0 {
            return Completed::Message(message);
        }

        if length > MAX_SIP_MESSAGE_SIZE {
            warn!("Dropping INVITE: declared body of {} bytes is too large", length);
            return Completed::Dropped;
        }

        trace!("Message with body, reading {} bytes", length);
        self.pending = Some(PendingBody {
            header_block,
            length,
        });
        Completed::AwaitingBody
    }

    fn finish_body(pending: PendingBody, body: &[u8]) -> Option<RawMessage> {
        let body = String::from_utf8_lossy(body).into_owned();
        match RawMessage::with_body(pending.header_block, body) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Dropping message with body: {}", e);
                None
            }
        }
    }
}

impl Decoder for SipFramer {
    type Item = RawMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<RawMessage>> {
        loop {
            if let Some(pending) = self.pending.take() {
                if src.len() < pending.length {
                    self.pending = Some(pending);
                    return Ok(None);
                }

                let body = src.split_to(pending.length);
                match Self::finish_body(pending, &body) {
                    Some(message) => return Ok(Some(message)),
                    None => continue,
                }
            }

            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                if src.len() + self.accumulated.len() > MAX_SIP_MESSAGE_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "SIP header block too large",
                    ));
                }
                return Ok(None);
            };

            let raw_line = src.split_to(newline + 1);
            let line = String::from_utf8_lossy(&raw_line);
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            // CRLF keep-alives between messages
            if line.is_empty() && self.accumulated.is_empty() {
                continue;
            }

            self.accumulated.push_str(line);
            self.accumulated.push('\n');

            if self.accumulated.len() > MAX_SIP_MESSAGE_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "SIP header block too large",
                ));
            }

            if !self.accumulated.ends_with("\n\n") {
                continue;
            }

            let header_block = std::mem::take(&mut self.accumulated);
            match self.complete_header_block(header_block) {
                Completed::Message(message) => return Ok(Some(message)),
                Completed::AwaitingBody | Completed::Dropped => continue,
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<RawMessage>> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }

        if let Some(pending) = self.pending.take() {
            let body = src.split_to(src.len());
            warn!(
                "Not enough bytes read! Expected [{}] but got {}",
                pending.length,
                body.len()
            );
            return Ok(Self::finish_body(pending, &body));
        }

        if !src.is_empty() || !self.accumulated.is_empty() {
            debug!("Discarding incomplete header block at end of stream");
            src.clear();
            self.accumulated.clear();
        }

        Ok(None)
    }
}

/// Lazy stream of framed messages read from `reader`
pub fn frame_messages<R: AsyncRead>(reader: R) -> FramedRead<R, SipFramer> {
    FramedRead::new(reader, SipFramer::new())
}

/// Transport-level close conditions that end the stream normally
fn is_connection_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Reader worker: frames `reader` and hands every message to `router` in wire order.
///
/// Returns `Ok(())` when the peer closes the stream or `cancel` fires.
pub async fn run_reader<R>(
    reader: R,
    router: Arc<MessageRouter>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = frame_messages(reader);
    trace!("Now listening for incoming messages");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Reader cancelled");
                return Ok(());
            }

            next = frames.next() => match next {
                Some(Ok(message)) => {
                    trace!("Received message:\n[{}]", message);
                    router.route(message);
                }
                Some(Err(e)) if is_connection_closed(&e) => {
                    debug!("Connection closed by peer: {}", e);
                    return Ok(());
                }
                Some(Err(e)) => {
                    error!("Problem while reading input from socket: {}", e);
                    return Err(SipError::Transport(e.to_string()));
                }
                None => {
                    debug!("Stream ended");
                    return Ok(());
                }
            }
        }
    }
}
