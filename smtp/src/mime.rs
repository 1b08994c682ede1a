//! Incremental MIME decoding of a captured DATA stream.
//!
//! The decoder walks the message line by line, keeping only the current part's
//! transfer encoding and a stack of active multipart boundaries. Body lines
//! encoded as base64 or quoted-printable are decoded in place; everything else
//! (headers, unencoded parts, SMTP commands preceding the message) is kept as
//! received. The charset of the payload is never converted, so rules match the
//! bytes the sender actually used.

use base64::{
    alphabet,
    engine::{general_purpose::GeneralPurposeConfig, DecodePaddingMode, GeneralPurpose},
    Engine,
};
use mail_parser::decoders::quoted_printable::quoted_printable_decode;
use memchr::memmem;
use tracing::trace;

use crate::SmtpError;

/// Base64 engine that tolerates missing or superfluous padding on a line.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const BOUNDARY_PARAM: &[u8] = b"boundary=";
const TRANSFER_ENCODING_HEADER: &[u8] = b"content-transfer-encoding:";
const MESSAGE_ID_HEADER: &[u8] = b"message-id:";

/// Headers whose RFC 2047 encoded words are decoded before classification.
const DECODED_HEADERS: [&[u8]; 3] = [b"subject:", b"from:", b"to:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    None,
    Base64,
    QuotedPrintable,
}

/// Per-message decoding state, advanced one line at a time.
#[derive(Debug)]
pub struct DecodeState {
    in_header_phase: bool,
    encoding: TransferEncoding,
    boundaries: Vec<Vec<u8>>,
}

impl Default for DecodeState {
    fn default() -> Self {
        Self {
            in_header_phase: true,
            encoding: TransferEncoding::None,
            boundaries: Vec::new(),
        }
    }
}

impl DecodeState {
    pub fn in_header_phase(&self) -> bool {
        self.in_header_phase
    }

    pub fn encoding(&self) -> TransferEncoding {
        self.encoding
    }

    pub fn boundary_depth(&self) -> usize {
        self.boundaries.len()
    }

    /// Updates the state for `line`, which still carries its trailing CR (if
    /// any) but not the LF.
    pub fn advance(&mut self, line: &[u8]) {
        if let Some(marker) = self.boundaries.last() {
            if line.starts_with(marker) {
                let closes = line[marker.len()..].starts_with(b"--");
                self.in_header_phase = true;
                self.encoding = TransferEncoding::None;
                if closes {
                    self.boundaries.pop();
                }
                return;
            }
        }

        if !self.in_header_phase {
            return;
        }

        if let Some(token) = boundary_parameter(line) {
            let mut marker = Vec::with_capacity(token.len() + 2);
            marker.extend_from_slice(b"--");
            marker.extend_from_slice(token);
            self.boundaries.push(marker);
        } else if line == b"\r" || line.is_empty() {
            self.in_header_phase = false;
        } else if starts_with_ignore_case(line, TRANSFER_ENCODING_HEADER) {
            let value = line[TRANSFER_ENCODING_HEADER.len()..].to_ascii_lowercase();
            self.encoding = if memmem::find(&value, b"quoted-printable").is_some() {
                TransferEncoding::QuotedPrintable
            } else if memmem::find(&value, b"base64").is_some() {
                TransferEncoding::Base64
            } else {
                TransferEncoding::None
            };
        }
    }
}

/// The canonical representation handed to the rule matcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMessage {
    /// Decoded message with every line terminated by CRLF.
    pub body: Vec<u8>,
    /// First `Message-ID` header value seen in a header block, angle brackets
    /// included. Empty when the message carries none.
    pub message_id: Vec<u8>,
}

impl DecodedMessage {
    /// The header block: everything before the first empty line.
    pub fn header(&self) -> &[u8] {
        match memmem::find(&self.body, b"\r\n\r\n") {
            Some(end) => &self.body[..end],
            None => &self.body,
        }
    }
}

/// Decodes a raw DATA-phase capture into its canonical form.
pub fn decode_message(raw: &[u8]) -> DecodedMessage {
    let mut state = DecodeState::default();
    let mut out = Vec::with_capacity(raw.len());
    let mut message_id = Vec::new();

    for line in raw.split(|&b| b == b'\n') {
        state.advance(line);

        if state.in_header_phase && message_id.is_empty() {
            if let Some(id) = message_id_value(line) {
                message_id = id.to_vec();
            }
        }

        if state.in_header_phase && is_continuation(line) && !out.is_empty() {
            // Unfold: the previous line loses its CR so both end up on one line.
            if out.last() == Some(&b'\r') {
                out.pop();
            }
            let continuation = trim_start_whitespace(line);
            // Adjacent encoded words stay separated so they can still be decoded.
            if out.ends_with(b"?=") && continuation.starts_with(b"=?") {
                out.push(b' ');
            }
            out.extend_from_slice(continuation);
            continue;
        }

        if state.in_header_phase || line == b"\r" {
            out.extend_from_slice(line);
            continue;
        }

        let decoded = match state.encoding {
            TransferEncoding::None => {
                out.extend_from_slice(line);
                continue;
            }
            TransferEncoding::Base64 => decode_base64_line(line),
            TransferEncoding::QuotedPrintable => decode_quoted_printable_line(line),
        };
        match decoded {
            Ok(decoded) => out.extend_from_slice(&decoded),
            Err(e) => {
                trace!(error = %e, "keeping undecodable line");
                out.extend_from_slice(line);
            }
        }
    }

    let body = normalize_line_endings(&out);
    let body = decode_header_words(body);
    DecodedMessage { body, message_id }
}

fn decode_base64_line(line: &[u8]) -> Result<Vec<u8>, SmtpError> {
    let compact: Vec<u8> = line
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    LENIENT_BASE64
        .decode(compact)
        .map_err(|e| SmtpError::DecodeError {
            encoding: "base64",
            message: e.to_string(),
        })
}

fn decode_quoted_printable_line(line: &[u8]) -> Result<Vec<u8>, SmtpError> {
    let had_cr = line.ends_with(b"\r");
    let content = line.strip_suffix(b"\r").unwrap_or(line);
    if content.is_empty() {
        return Ok(if had_cr { b"\r".to_vec() } else { Vec::new() });
    }
    // A trailing `=` is a soft line break: the next line continues this one.
    let soft_break = content.ends_with(b"=");
    let decoded = if soft_break {
        let mut soft = Vec::with_capacity(content.len() + 2);
        soft.extend_from_slice(content);
        soft.extend_from_slice(b"\r\n");
        quoted_printable_decode(&soft)
    } else {
        quoted_printable_decode(content)
    };
    let mut decoded = decoded.ok_or_else(|| SmtpError::DecodeError {
        encoding: "quoted-printable",
        message: "invalid escape sequence".to_string(),
    })?;
    if had_cr && !soft_break {
        decoded.push(b'\r');
    }
    Ok(decoded)
}

/// Drops every LF, then expands every CR into CRLF.
fn normalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    for &b in data {
        match b {
            b'\n' => {}
            b'\r' => out.extend_from_slice(b"\r\n"),
            _ => out.push(b),
        }
    }
    out
}

/// Replaces RFC 2047 encoded words in the Subject, From and To headers of the
/// leading header block with their decoded text. Headers that fail to parse are
/// left untouched.
fn decode_header_words(body: Vec<u8>) -> Vec<u8> {
    let header_end = memmem::find(&body, b"\r\n\r\n").unwrap_or(body.len());
    let header = &body[..header_end];
    if memmem::find(header, b"=?").is_none() {
        return body;
    }

    let mut out = Vec::with_capacity(body.len());
    for (i, line) in header.split(|&b| b == b'\n').enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        let (content, had_cr) = match line.strip_suffix(b"\r") {
            Some(content) => (content, true),
            None => (line, false),
        };
        match decode_header_line(content) {
            Some(decoded) => out.extend_from_slice(&decoded),
            None => out.extend_from_slice(content),
        }
        if had_cr {
            out.push(b'\r');
        }
    }
    out.extend_from_slice(&body[header_end..]);
    out
}

fn decode_header_line(line: &[u8]) -> Option<Vec<u8>> {
    if !DECODED_HEADERS
        .iter()
        .any(|name| starts_with_ignore_case(line, name))
    {
        return None;
    }
    if memmem::find(line, b"=?").is_none() {
        return None;
    }
    match mailparse::parse_header(line) {
        Ok((header, _)) => {
            let mut decoded = header.get_key().into_bytes();
            decoded.extend_from_slice(b": ");
            decoded.extend_from_slice(header.get_value().as_bytes());
            Some(decoded)
        }
        Err(e) => {
            trace!(error = %e, "keeping encoded header");
            None
        }
    }
}

/// Extracts the value of a `Message-ID:` header line.
fn message_id_value(line: &[u8]) -> Option<&[u8]> {
    if !starts_with_ignore_case(line, MESSAGE_ID_HEADER) {
        return None;
    }
    let value = trim_start_whitespace(&line[MESSAGE_ID_HEADER.len()..]);
    if !value.starts_with(b"<") {
        return None;
    }
    let end = value.iter().rposition(|&b| b == b'>')?;
    Some(&value[..=end])
}

/// Reads the token of a `boundary=` parameter, quoted or not.
fn boundary_parameter(line: &[u8]) -> Option<&[u8]> {
    let start = memmem::find(line, BOUNDARY_PARAM).filter(|&idx| idx > 0)? + BOUNDARY_PARAM.len();
    let value = &line[start..];
    let token = match value.strip_prefix(b"\"") {
        Some(quoted) => {
            let end = memchr::memchr(b'"', quoted).unwrap_or(quoted.len());
            &quoted[..end]
        }
        None => {
            let end = value
                .iter()
                .position(|b| matches!(b, b';' | b' ' | b'\t' | b'\r'))
                .unwrap_or(value.len());
            &value[..end]
        }
    };
    let token = token.strip_suffix(b"\r").unwrap_or(token);
    (!token.is_empty()).then_some(token)
}

fn is_continuation(line: &[u8]) -> bool {
    matches!(line.first(), Some(b' ' | b'\t'))
}

fn trim_start_whitespace(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(line.len());
    &line[start..]
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}
