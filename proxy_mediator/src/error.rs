//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::{
    crypto::CryptoError, envelope::EnvelopeError, message::MessageError, state::StateError,
    transport::TransportError,
};

/// A protocol error that may be surfaced to a peer, carrying a stable code.
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct ReportableError {
    pub code: &'static str,
    pub message: String,
}

impl ReportableError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("no connection found for recipients {0:?}")]
    ConnectionNotFound(Vec<String>),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("connection signature did not verify")]
    SignatureVerification,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Reportable(#[from] ReportableError),
    #[error("no handler registered for message type `{0}`")]
    UnknownMessageType(String),
    #[error("connection completion signal already fulfilled")]
    AlreadyCompleted,
    #[error("connection has no transport target")]
    NoTarget,
    #[error("inbound message carries no recipient key")]
    MissingRecipient,
    #[error("invitation is malformed: {0}")]
    MalformedInvitation(&'static str),
    #[error("connection block is malformed: {0}")]
    MalformedConnectionBlock(&'static str),
}
