//! Lifecycle state machine for pairwise connections.
//!
//! Both sides of the handshake walk a fixed transition graph: the inviter
//! through `invite_sent -> request_received -> response_sent`, the invitee
//! through `invite_received -> request_sent -> response_received`, and both
//! converge on `complete` via the first trust ping. Events fired from any
//! other state are programming errors and are rejected without mutating the
//! current state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal connection state transition: {event:?} while in state {from:?}")]
    IllegalTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Null,
    InviteSent,
    InviteReceived,
    RequestSent,
    RequestReceived,
    ResponseSent,
    ResponseReceived,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    SendInvite,
    ReceiveInvite,
    SendRequest,
    ReceiveRequest,
    SendResponse,
    ReceiveResponse,
    SendPing,
    ReceivePing,
    SendPingResponse,
    ReceivePingResponse,
}

impl ConnectionState {
    /// Apply `event` to the current state, yielding the next state.
    ///
    /// Pings exchanged after completion are self-loops so that peers may
    /// re-ping an established connection without error.
    pub fn transition(self, event: ConnectionEvent) -> Result<ConnectionState, StateError> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Null, SendInvite) => Ok(InviteSent),
            (Null, ReceiveInvite) => Ok(InviteReceived),
            (InviteReceived, SendRequest) => Ok(RequestSent),
            (InviteSent, ReceiveRequest) => Ok(RequestReceived),
            (RequestReceived, SendResponse) => Ok(ResponseSent),
            (RequestSent, ReceiveResponse) => Ok(ResponseReceived),
            (ResponseReceived | Complete, SendPing) => Ok(Complete),
            (ResponseSent | Complete, ReceivePing) => Ok(Complete),
            (Complete, SendPingResponse) => Ok(Complete),
            (Complete, ReceivePingResponse) => Ok(Complete),
            (from, event) => Err(StateError::IllegalTransition { from, event }),
        }
    }
}
