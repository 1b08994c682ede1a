use bytes::BytesMut;
use memchr::memmem;

use crate::{
    mime::{decode_message, DecodedMessage},
    parser::{parse_client_line, xforward_arguments, ClientLine},
    DATA_TERMINATOR,
};

const RECEIVED_SPF: &[u8] = b"Received-SPF:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the DATA command: envelope commands are still being exchanged.
    Header,
    /// Between DATA and the data terminator.
    Data,
}

/// Tracks the protocol landmarks of one SMTP session from the client's side of
/// the stream and accumulates what the client sends until a complete message
/// can be handed to the decoder.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Phase,
    raw_buffer: Vec<u8>,
    is_local_relay: bool,
    message_id: Vec<u8>,
    xforward_value: Option<Vec<u8>>,
    header_rewrite_pending: bool,
    /// Whether the last byte passed through [`PhaseTracker::rewrite`] ended a line.
    at_line_start: bool,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        PhaseTracker {
            phase: Phase::Header,
            raw_buffer: Vec::new(),
            is_local_relay: false,
            message_id: Vec::new(),
            xforward_value: None,
            header_rewrite_pending: false,
            at_line_start: true,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True once an `XFORWARD NAME=... SOURCE=LOCAL` line was seen. Local
    /// resubmissions are never classified.
    pub fn is_local_relay(&self) -> bool {
        self.is_local_relay
    }

    /// Message-ID of the last completed message, empty if none was found.
    pub fn message_id(&self) -> &[u8] {
        &self.message_id
    }

    pub fn xforward_value(&self) -> Option<&[u8]> {
        self.xforward_value.as_deref()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.raw_buffer
    }

    /// Feeds one client chunk. Returns the decoded message when the chunk
    /// completes a DATA section.
    pub fn observe(&mut self, chunk: &[u8]) -> Option<DecodedMessage> {
        if self.is_local_relay {
            return None;
        }

        if self.phase == Phase::Header {
            for line in chunk.split_inclusive(|&b| b == b'\n') {
                let command = parse_client_line(line);
                match command {
                    ClientLine::XForward(_) => {
                        self.note_xforward(line);
                        if command.is_local_source() {
                            self.is_local_relay = true;
                            self.raw_buffer.clear();
                            return None;
                        }
                    }
                    ClientLine::Data => {
                        self.phase = Phase::Data;
                        break;
                    }
                    ClientLine::Other => {}
                }
            }
        }

        self.raw_buffer.extend_from_slice(chunk);
        if self.phase == Phase::Data && self.raw_buffer.ends_with(DATA_TERMINATOR) {
            let raw = std::mem::take(&mut self.raw_buffer);
            self.phase = Phase::Header;
            let decoded = decode_message(&raw);
            self.message_id = decoded.message_id.clone();
            return Some(decoded);
        }
        None
    }

    /// Copies `chunk` into `out`. The first `Received-SPF:` line following an
    /// XFORWARD command gets an `X-Forward` trace header inserted in front of
    /// it; after that the stream is copied untouched.
    pub fn rewrite(&mut self, chunk: &[u8], session_id: &str, out: &mut BytesMut) {
        let line_start = self.at_line_start;
        if let Some(&last) = chunk.last() {
            self.at_line_start = last == b'\n';
        }

        if !self.header_rewrite_pending {
            out.extend_from_slice(chunk);
            return;
        }

        let at = memmem::find_iter(chunk, RECEIVED_SPF).find(|&pos| match pos {
            0 => line_start,
            _ => chunk[pos - 1] == b'\n',
        });
        let Some(at) = at else {
            out.extend_from_slice(chunk);
            return;
        };

        out.extend_from_slice(&chunk[..at]);
        out.extend_from_slice(b"X-Forward: ");
        out.extend_from_slice(self.xforward_value.as_deref().unwrap_or_default());
        out.extend_from_slice(b" file=");
        out.extend_from_slice(session_id.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&chunk[at..]);
        self.header_rewrite_pending = false;
    }

    fn note_xforward(&mut self, line: &[u8]) {
        let Some(args) = xforward_arguments(line) else {
            return;
        };
        let value = self.xforward_value.get_or_insert_with(Vec::new);
        if !value.is_empty() {
            value.push(b' ');
        }
        value.extend_from_slice(args);
        self.header_rewrite_pending = true;
    }
}
