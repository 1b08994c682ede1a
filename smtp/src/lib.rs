use miette::Diagnostic;
use thiserror::Error;

pub mod mime;
mod parser;
pub mod phase;
pub mod relay;

pub use mime::{decode_message, DecodedMessage};
pub use parser::*;
pub use phase::{Phase, PhaseTracker};
pub use relay::{pump, Flow, RelayEnd, Tap};

/// Reply sent to the client when a session fails for any internal reason.
pub const INTERNAL_ERROR_REPLY: &[u8] = b"450 internal error\r\n";

/// The SMTP data terminator, `<CRLF>.<CRLF>`.
pub const DATA_TERMINATOR: &[u8] = b"\r\n.\r\n";

#[derive(Debug, Error, Diagnostic)]
pub enum SmtpError {
    #[error("IO error")]
    #[diagnostic(code(smtp::io_error))]
    IoError(#[from] std::io::Error),

    #[error("failed to decode {encoding} line: {message}")]
    #[diagnostic(code(smtp::decode_error))]
    DecodeError {
        encoding: &'static str,
        message: String,
    },
}

/// Builds the synthetic reply injected toward the client when a message is
/// classified as spam.
pub fn spam_reply(code: u16) -> Vec<u8> {
    format!("{} SPAM checker was invoked.\r\n", code).into_bytes()
}
