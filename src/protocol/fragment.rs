//! Splitting oversized frames with FOLLOWS and putting them back together.
//!
//! The first fragment keeps the original frame type and its type fields;
//! continuations are PAYLOAD frames. Metadata is sent before data, so a
//! fragment carries metadata, data or the boundary between the two.

use std::collections::{HashMap, HashSet};

use bytes::{Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{flags, FrameType};
use crate::error::{RSocketError, Result};

/// Split `frame` so no fragment carries more than `mtu` metadata + data bytes.
///
/// Frames that cannot fragment, or already fit, are returned unchanged.
pub fn fragment(frame: Frame, mtu: usize) -> Vec<Frame> {
    let metadata_len = frame.metadata.as_ref().map(|m| m.len()).unwrap_or(0);
    if mtu == 0 || !frame.frame_type.can_fragment() || metadata_len + frame.data.len() <= mtu {
        return vec![frame];
    }

    let mut metadata = frame.metadata.clone();
    let mut data = frame.data.clone();
    let mut fragments = Vec::new();
    let mut first = true;
    // completion belongs to the last fragment
    let final_flags = frame.flags & (flags::COMPLETE | flags::NEXT);

    while first || metadata.is_some() || !data.is_empty() {
        let mut budget = mtu;
        let mut piece = if first {
            let mut head = frame.clone();
            head.flags &= !(flags::COMPLETE | flags::METADATA_PRESENT);
            head.metadata = None;
            head.data = Bytes::new();
            head
        } else {
            Frame::new(frame.stream_id, FrameType::Payload, 0)
        };

        if let Some(mut meta) = metadata.take() {
            let take = meta.len().min(budget);
            piece.metadata = Some(meta.split_to(take));
            budget -= take;
            if !meta.is_empty() {
                metadata = Some(meta);
            }
        }
        if metadata.is_none() && budget > 0 {
            let take = data.len().min(budget);
            piece.data = data.split_to(take);
        }

        let last = metadata.is_none() && data.is_empty();
        if last {
            piece.flags |= final_flags;
        } else {
            piece.flags |= flags::FOLLOWS;
        }
        fragments.push(piece);
        first = false;
    }
    fragments
}

struct Partial {
    head: Frame,
    metadata: Option<BytesMut>,
    data: BytesMut,
    size: usize,
}

/// Per-stream reassembly of FOLLOWS chains.
///
/// A chain that breaks (too large, or interrupted by a frame that has no
/// place in it) leaves its stream id poisoned: the remaining fragments are
/// swallowed up to and including the one without FOLLOWS.
pub struct Reassembler {
    partial: HashMap<u32, Partial>,
    poisoned: HashSet<u32>,
    limit: usize,
}

impl Reassembler {
    /// Reassembler that refuses chains larger than `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            partial: HashMap::new(),
            poisoned: HashSet::new(),
            limit,
        }
    }

    /// Feed one inbound frame.
    ///
    /// Returns the complete frame once the chain ends, `None` while more
    /// fragments are expected. Frames outside a chain pass straight through.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Frame>> {
        let stream_id = frame.stream_id;

        if self.poisoned.contains(&stream_id) {
            return match frame.frame_type {
                FrameType::Payload => {
                    if !frame.follows() {
                        self.poisoned.remove(&stream_id);
                    }
                    Ok(None)
                }
                FrameType::Error => {
                    self.poisoned.remove(&stream_id);
                    Ok(Some(frame))
                }
                FrameType::Cancel | FrameType::RequestN => Ok(Some(frame)),
                other => {
                    self.poisoned.remove(&stream_id);
                    Err(RSocketError::violation(
                        stream_id,
                        format!("{} inside a broken fragment chain", other),
                    ))
                }
            };
        }

        let Some(mut partial) = self.partial.remove(&stream_id) else {
            if !frame.follows() {
                return Ok(Some(frame));
            }
            let size = frame.metadata.as_ref().map(|m| m.len()).unwrap_or(0) + frame.data.len();
            self.check_size(stream_id, size)?;
            let mut head = frame;
            let metadata = head.metadata.take().map(|m| BytesMut::from(&m[..]));
            let data = BytesMut::from(&head.data[..]);
            head.data = Bytes::new();
            self.partial.insert(
                stream_id,
                Partial {
                    head,
                    metadata,
                    data,
                    size,
                },
            );
            return Ok(None);
        };

        match frame.frame_type {
            FrameType::Payload => {}
            // the peer's value is gone with the stream
            FrameType::Error => return Ok(Some(frame)),
            // control frames for the other direction may arrive mid-chain
            FrameType::Cancel | FrameType::RequestN => {
                self.partial.insert(stream_id, partial);
                return Ok(Some(frame));
            }
            other => {
                self.poisoned.insert(stream_id);
                return Err(RSocketError::violation(
                    stream_id,
                    format!("{} inside a fragment chain", other),
                ));
            }
        }

        partial.size += frame.metadata.as_ref().map(|m| m.len()).unwrap_or(0) + frame.data.len();
        self.check_size(stream_id, partial.size)?;

        if let Some(meta) = &frame.metadata {
            partial
                .metadata
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(meta);
        }
        partial.data.extend_from_slice(&frame.data);

        if frame.follows() {
            self.partial.insert(stream_id, partial);
            return Ok(None);
        }

        let mut whole = partial.head;
        whole.flags &= !flags::FOLLOWS;
        whole.flags |= frame.flags & (flags::COMPLETE | flags::NEXT);
        if whole.frame_type != FrameType::Payload {
            // completion on a request chain only applies to REQUEST_CHANNEL
            if whole.frame_type != FrameType::RequestChannel {
                whole.flags &= !flags::COMPLETE;
            }
            whole.flags &= !flags::NEXT;
        }
        whole.metadata = partial.metadata.map(BytesMut::freeze);
        if whole.metadata.is_some() {
            whole.flags |= flags::METADATA_PRESENT;
        }
        whole.data = partial.data.freeze();
        Ok(Some(whole))
    }

    /// Drop a partially received chain (stream ended or cancelled).
    pub fn discard(&mut self, stream_id: u32) {
        self.partial.remove(&stream_id);
        self.poisoned.remove(&stream_id);
    }

    /// Whether fragments for `stream_id` are still expected.
    pub fn in_chain(&self, stream_id: u32) -> bool {
        self.partial.contains_key(&stream_id) || self.poisoned.contains(&stream_id)
    }

    /// Chains being assembled or skipped.
    pub fn pending(&self) -> usize {
        self.partial.len() + self.poisoned.len()
    }

    fn check_size(&mut self, stream_id: u32, size: usize) -> Result<()> {
        if size > self.limit {
            self.partial.remove(&stream_id);
            self.poisoned.insert(stream_id);
            return Err(RSocketError::violation(
                stream_id,
                format!("reassembled frame exceeds {} bytes", self.limit),
            ));
        }
        Ok(())
    }
}
