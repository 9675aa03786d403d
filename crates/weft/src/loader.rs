use std::collections::VecDeque;

use tracing::{trace, warn};
use weft_utils::{alloc, bug_assert};

use crate::{
    error::{Error, Result},
    message::Message,
    wire::{self, OFFSET_HEADER_LEN, OFFSET_TOTAL_LEN, PROLOGUE_LEN},
};

/// Smallest writable region [`MessageLoader::get_buffer`] hands out; also the
/// initial buffer allocation.
pub const MIN_BUFSIZE: usize = 32;

/// Default cap on a single framed message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 27;

/// What the framer can tell about the current buffered prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not enough bytes yet. `declared` carries the total frame length when
    /// the prefix already reveals it, so oversized frames are rejected before
    /// they finish arriving.
    NeedMore { declared: Option<usize> },
    /// A complete frame is buffered: `header_len` header bytes followed by
    /// body bytes up to `total_len`.
    Complete { header_len: usize, total_len: usize },
    /// The prefix cannot be a valid frame.
    Corrupt,
}

/// Splits a byte stream into frames. The loader only ever asks two things of
/// a framing scheme: is a full message buffered, and how long is it.
pub trait Framer {
    fn assess(&self, prefix: &[u8]) -> FrameStatus;
}

/// Placeholder framing: every `n` bytes form one message, all of it body.
#[derive(Clone, Copy, Debug)]
pub struct FixedFramer(pub usize);

impl Framer for FixedFramer {
    fn assess(&self, prefix: &[u8]) -> FrameStatus {
        if prefix.len() >= self.0 {
            FrameStatus::Complete { header_len: 0, total_len: self.0 }
        } else {
            FrameStatus::NeedMore { declared: Some(self.0) }
        }
    }
}

/// The real framing: validates and splits by the wire prologue.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrologueFramer;

impl Framer for PrologueFramer {
    fn assess(&self, prefix: &[u8]) -> FrameStatus {
        if prefix.len() < PROLOGUE_LEN {
            return FrameStatus::NeedMore { declared: None };
        }

        let total_len = wire::get_u32(prefix, OFFSET_TOTAL_LEN) as usize;
        let header_len = wire::get_u32(prefix, OFFSET_HEADER_LEN) as usize;
        if header_len < PROLOGUE_LEN || header_len > total_len {
            return FrameStatus::Corrupt;
        }

        if prefix.len() < total_len {
            FrameStatus::NeedMore { declared: Some(total_len) }
        } else {
            FrameStatus::Complete { header_len, total_len }
        }
    }
}

/// Incremental stream-to-message parser.
///
/// The transport borrows the buffer tail through [`get_buffer`], reads network
/// data directly into it, and hands it back through [`return_buffer`]; each
/// return drives the framing state machine and appends completed, locked
/// messages to an internal FIFO drained by [`pop_message`].
///
/// [`get_buffer`]: MessageLoader::get_buffer
/// [`return_buffer`]: MessageLoader::return_buffer
/// [`pop_message`]: MessageLoader::pop_message
#[derive(Debug)]
pub struct MessageLoader {
    /// Buffered stream bytes; always sized to `allocated`.
    buf: Vec<u8>,
    allocated: usize,
    length: usize,
    messages: VecDeque<Message>,
    framer: Box<dyn Framer>,
    max_message_size: usize,
    corrupted: bool,
    buffer_outstanding: bool,
}

impl std::fmt::Debug for dyn Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Framer")
    }
}

impl MessageLoader {
    pub fn new(framer: Box<dyn Framer>) -> Self {
        Self {
            buf: Vec::new(),
            allocated: 0,
            length: 0,
            messages: VecDeque::new(),
            framer,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            corrupted: false,
            buffer_outstanding: false,
        }
    }

    /// Borrows the writable region at the tail of the buffer, growing it
    /// first when the free tail has shrunk below [`MIN_BUFSIZE`].
    ///
    /// Until the matching [`return_buffer`](Self::return_buffer), calling any
    /// other mutating operation is a programming error.
    pub fn get_buffer(&mut self) -> Result<&mut [u8]> {
        bug_assert!(!self.buffer_outstanding, "loader buffer borrowed twice");
        bug_assert!(!self.corrupted, "loader used after corruption");

        if self.length + MIN_BUFSIZE >= self.allocated {
            // Double, plus MIN_BUFSIZE in case allocated == 0. Reject
            // non-growing arithmetic strictly.
            let grown = self
                .allocated
                .checked_mul(2)
                .and_then(|doubled| doubled.checked_add(MIN_BUFSIZE))
                .ok_or(Error::Overflow)?;

            let additional = grown - self.buf.len();
            alloc::reserve_vec(&mut self.buf, additional)?;
            self.buf.resize(grown, 0);
            self.allocated = grown;
        }

        self.buffer_outstanding = true;
        Ok(&mut self.buf[self.length..self.allocated])
    }

    /// Returns the borrow taken with [`get_buffer`](Self::get_buffer),
    /// asserting that `bytes_read` bytes were written at its start, and
    /// extracts any now-complete messages.
    pub fn return_buffer(&mut self, bytes_read: usize) {
        bug_assert!(self.buffer_outstanding, "loader buffer returned without a borrow");
        bug_assert!(
            self.length + bytes_read <= self.allocated,
            "more bytes returned than were handed out"
        );

        self.buffer_outstanding = false;
        self.length += bytes_read;
        self.extract_messages();
    }

    /// Removes and returns the oldest complete message.
    pub fn pop_message(&mut self) -> Option<Message> {
        bug_assert!(!self.buffer_outstanding, "loader drained while buffer is borrowed");
        self.messages.pop_front()
    }

    /// Number of complete messages waiting to be popped.
    pub fn queued_messages(&self) -> usize {
        self.messages.len()
    }

    /// Stream bytes buffered but not yet framed into a message.
    pub fn pending_bytes(&self) -> usize {
        self.length
    }

    /// One-way flag: a frame that can never parse was seen and the loader has
    /// stopped making progress. The transport is expected to close the
    /// connection.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn extract_messages(&mut self) {
        if self.corrupted {
            return;
        }

        loop {
            match self.framer.assess(&self.buf[..self.length]) {
                FrameStatus::NeedMore { declared } => {
                    if let Some(total_len) = declared
                        && total_len > self.max_message_size
                    {
                        self.mark_corrupted(total_len);
                    }
                    break;
                }
                FrameStatus::Corrupt => {
                    warn!("unparseable frame, marking stream corrupted");
                    self.corrupted = true;
                    break;
                }
                FrameStatus::Complete { header_len, total_len } => {
                    if total_len > self.max_message_size {
                        self.mark_corrupted(total_len);
                        break;
                    }

                    // Claim the queue slot first so a failure here leaves the
                    // stream bytes untouched for a later retry.
                    if alloc::reserve_deque(&mut self.messages, 1).is_err() {
                        break;
                    }
                    let Ok(message) = Message::from_wire(
                        &self.buf[..header_len],
                        &self.buf[header_len..total_len],
                    ) else {
                        break;
                    };

                    trace!(serial = message.serial(), total_len, "message loaded");
                    self.messages.push_back(message);
                    self.buf.copy_within(total_len..self.length, 0);
                    self.length -= total_len;
                }
            }
        }
    }

    fn mark_corrupted(&mut self, declared: usize) {
        warn!(declared, max = self.max_message_size, "frame exceeds maximum message size");
        self.corrupted = true;
    }
}
