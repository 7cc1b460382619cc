//! Per-stream state machines for the four interaction models.
//!
//! A stream is tracked as two directions:
//!
//! - **inbound**: frames carrying values from the peer to us
//! - **outbound**: frames carrying values from us to the peer
//!
//! Each model starts with a different set of open directions (a requester
//! of request-stream only ever receives, for instance). PAYLOAD with
//! COMPLETE, or a COMPLETE frame, closes the sender's direction. CANCEL
//! closes the direction it is aimed at. ERROR closes everything. The stream
//! is terminal once both directions are closed.

use std::fmt;

use crate::error::{RSocketError, Result};
use crate::protocol::{flags, Frame, FrameType};

/// The four interaction models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionModel {
    RequestResponse,
    FireAndForget,
    RequestStream,
    RequestChannel,
}

impl InteractionModel {
    /// Model opened by a REQUEST_* frame type.
    pub fn from_request_type(frame_type: FrameType) -> Option<Self> {
        match frame_type {
            FrameType::RequestResponse => Some(InteractionModel::RequestResponse),
            FrameType::RequestFnf => Some(InteractionModel::FireAndForget),
            FrameType::RequestStream => Some(InteractionModel::RequestStream),
            FrameType::RequestChannel => Some(InteractionModel::RequestChannel),
            _ => None,
        }
    }

    pub fn request_frame_type(self) -> FrameType {
        match self {
            InteractionModel::RequestResponse => FrameType::RequestResponse,
            InteractionModel::FireAndForget => FrameType::RequestFnf,
            InteractionModel::RequestStream => FrameType::RequestStream,
            InteractionModel::RequestChannel => FrameType::RequestChannel,
        }
    }

    /// Models that exchange REQUEST_N. The others carry an implicit credit of one.
    #[inline]
    pub fn is_flow_controlled(self) -> bool {
        matches!(
            self,
            InteractionModel::RequestStream | InteractionModel::RequestChannel
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            InteractionModel::RequestResponse => "request-response",
            InteractionModel::FireAndForget => "fire-and-forget",
            InteractionModel::RequestStream => "request-stream",
            InteractionModel::RequestChannel => "request-channel",
        }
    }
}

impl fmt::Display for InteractionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end of the stream we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requester,
    Responder,
}

/// The direction of a half-closed channel that has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    /// We will send nothing more.
    Local,
    /// The peer will send nothing more.
    Remote,
}

/// Observable stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Request-response requester waiting for its single reply.
    AwaitingResponse,
    /// Request-response responder with the reply still to send.
    Responding,
    /// Fire-and-forget request sent.
    Sent,
    /// Request-stream before the first PAYLOAD.
    AwaitingFirstPayload,
    Streaming,
    /// Channel with both directions live.
    Open,
    HalfClosed(Half),
    Completed,
    Cancelled,
    Errored,
}

impl StreamState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Cancelled | StreamState::Errored
        )
    }
}

/// What an accepted inbound frame means for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A value arrived; `complete` when it was the peer's last.
    Next { complete: bool },
    /// The peer finished sending without a value.
    Complete,
    /// The peer granted us `n` more credits.
    RequestN(u32),
    /// The peer no longer wants our values.
    Cancel,
    /// The peer failed the stream.
    Error,
}

/// Transition rules for one stream.
#[derive(Debug, Clone)]
pub struct StreamMachine {
    model: InteractionModel,
    role: Role,
    inbound_open: bool,
    outbound_open: bool,
    payload_seen: bool,
    cancelled: bool,
    errored: bool,
}

impl StreamMachine {
    /// State right after the REQUEST_* frame (with `request_flags`) went out
    /// or came in.
    pub fn new(model: InteractionModel, role: Role, request_flags: u8) -> Self {
        let requester = role == Role::Requester;
        let (inbound_open, outbound_open) = match model {
            InteractionModel::FireAndForget => (false, false),
            InteractionModel::RequestResponse | InteractionModel::RequestStream => {
                (requester, !requester)
            }
            InteractionModel::RequestChannel => {
                // COMPLETE on the request ends the requester's side immediately
                let requester_done = flags::has_flag(request_flags, flags::COMPLETE);
                if requester {
                    (true, !requester_done)
                } else {
                    (!requester_done, true)
                }
            }
        };
        Self {
            model,
            role,
            inbound_open,
            outbound_open,
            payload_seen: false,
            cancelled: false,
            errored: false,
        }
    }

    #[inline]
    pub fn model(&self) -> InteractionModel {
        self.model
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn inbound_open(&self) -> bool {
        self.inbound_open
    }

    #[inline]
    pub fn outbound_open(&self) -> bool {
        self.outbound_open
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !self.inbound_open && !self.outbound_open
    }

    pub fn state(&self) -> StreamState {
        if self.errored {
            return StreamState::Errored;
        }
        if self.is_terminal() {
            return if self.cancelled {
                StreamState::Cancelled
            } else {
                StreamState::Completed
            };
        }
        match self.model {
            InteractionModel::RequestResponse => match self.role {
                Role::Requester => StreamState::AwaitingResponse,
                Role::Responder => StreamState::Responding,
            },
            InteractionModel::FireAndForget => StreamState::Sent,
            InteractionModel::RequestStream if self.payload_seen => StreamState::Streaming,
            InteractionModel::RequestStream => StreamState::AwaitingFirstPayload,
            InteractionModel::RequestChannel => match (self.inbound_open, self.outbound_open) {
                (true, true) => StreamState::Open,
                (true, false) => StreamState::HalfClosed(Half::Local),
                _ => StreamState::HalfClosed(Half::Remote),
            },
        }
    }

    /// Account for a frame received from the peer.
    ///
    /// Returns a `ProtocolViolation` when the frame is illegal now; the
    /// machine is left untouched in that case.
    pub fn on_receive(&mut self, frame: &Frame) -> Result<Event> {
        let id = frame.stream_id;
        if self.is_terminal() {
            return Err(RSocketError::violation(
                id,
                format!("{} after terminal state", frame.frame_type),
            ));
        }

        match frame.frame_type {
            FrameType::Payload | FrameType::Complete => {
                if !self.inbound_open {
                    return Err(RSocketError::violation(
                        id,
                        format!("{} on a closed inbound direction", frame.frame_type),
                    ));
                }
                let next = frame.frame_type == FrameType::Payload && frame.is_next();
                let mut complete =
                    frame.frame_type == FrameType::Complete || frame.is_complete();
                if frame.frame_type == FrameType::Payload && !next && !complete {
                    return Err(RSocketError::violation(id, "PAYLOAD without NEXT or COMPLETE"));
                }
                if self.model == InteractionModel::RequestResponse && !next {
                    return Err(RSocketError::violation(
                        id,
                        "request-response reply without a value",
                    ));
                }
                // a request-response reply is always the last one
                if self.model == InteractionModel::RequestResponse {
                    complete = true;
                }
                if complete {
                    self.inbound_open = false;
                }
                if next {
                    self.payload_seen = true;
                    Ok(Event::Next { complete })
                } else {
                    Ok(Event::Complete)
                }
            }
            FrameType::RequestN => {
                if !self.model.is_flow_controlled() || !self.may_produce() {
                    return Err(RSocketError::violation(
                        id,
                        format!("REQUEST_N on {} {:?}", self.model, self.role),
                    ));
                }
                Ok(Event::RequestN(frame.request_n))
            }
            FrameType::Cancel => {
                if !self.outbound_open {
                    return Err(RSocketError::violation(id, "CANCEL with nothing left to send"));
                }
                self.outbound_open = false;
                self.cancelled = true;
                Ok(Event::Cancel)
            }
            FrameType::Error => {
                self.fail();
                Ok(Event::Error)
            }
            other => Err(RSocketError::violation(
                id,
                format!("{} on an open stream", other),
            )),
        }
    }

    /// Validate and account for a frame we are about to send.
    pub fn on_send(&mut self, frame: &Frame) -> Result<()> {
        let id = frame.stream_id;
        if self.is_terminal() {
            return Err(RSocketError::violation(
                id,
                format!("cannot send {} after terminal state", frame.frame_type),
            ));
        }

        match frame.frame_type {
            FrameType::Payload | FrameType::Complete => {
                if !self.outbound_open {
                    return Err(RSocketError::violation(
                        id,
                        format!("cannot send {} on a closed outbound direction", frame.frame_type),
                    ));
                }
                let next = frame.frame_type == FrameType::Payload && frame.is_next();
                if self.model == InteractionModel::RequestResponse && !next {
                    return Err(RSocketError::violation(
                        id,
                        "request-response reply must carry a value",
                    ));
                }
                if next {
                    self.payload_seen = true;
                }
                if frame.frame_type == FrameType::Complete
                    || frame.is_complete()
                    || self.model == InteractionModel::RequestResponse
                {
                    self.outbound_open = false;
                }
                Ok(())
            }
            FrameType::RequestN => {
                if !self.model.is_flow_controlled() || !self.inbound_open {
                    return Err(RSocketError::violation(
                        id,
                        "cannot grant credit on a closed inbound direction",
                    ));
                }
                Ok(())
            }
            FrameType::Cancel => {
                if !self.inbound_open {
                    return Err(RSocketError::violation(id, "cannot cancel a finished direction"));
                }
                self.inbound_open = false;
                self.cancelled = true;
                Ok(())
            }
            FrameType::Error => {
                self.fail();
                Ok(())
            }
            other => Err(RSocketError::violation(
                id,
                format!("cannot send {} on an open stream", other),
            )),
        }
    }

    /// Mark the stream failed (connection teardown, local error).
    pub fn fail(&mut self) {
        self.inbound_open = false;
        self.outbound_open = false;
        self.errored = true;
    }

    fn may_produce(&self) -> bool {
        self.role == Role::Responder || self.model == InteractionModel::RequestChannel
    }
}
