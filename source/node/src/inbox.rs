//! Inbound message ring
//!
//! The bus receive callback must return as quickly as possible, so received
//! messages are only copied into a tiny ring here, and decoded and handled
//! later from the main loop.
//!
//! The rules:
//!
//! * A slot with `len == 0` is empty.
//! * The writer always writes the slot at `write_idx`, then advances it. If
//!   that slot still holds an unread message, the message is lost. That is
//!   the price for never making the writer wait.
//! * The reader scans starting at `write_idx`, which is the oldest slot, and
//!   empties every slot it takes.
//! * A whole slot is written in one assignment, so the length of a slot is
//!   never visible before its payload.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};

use crate::MAX_MESSAGE_LEN;

/// The default number of received-but-unhandled messages
pub const INBOX_SIZE: usize = 3;

/// One received message, with the id of its sender
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    sender: u8,
    len: u8,
    data: [u8; MAX_MESSAGE_LEN],
}

impl Envelope {
    const EMPTY: Self = Envelope {
        sender: 0,
        len: 0,
        data: [0u8; MAX_MESSAGE_LEN],
    };

    /// The sender id, [`BROADCAST`][crate::BROADCAST] for broadcasts
    #[inline]
    pub fn sender(&self) -> u8 {
        self.sender
    }

    /// The received bytes
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Is this slot empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl core::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Envelope")
            .field("sender", &self.sender)
            .field("payload", &self.payload())
            .finish()
    }
}

/// Why [`InboundRing::push()`] refused a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Zero length, no tag
    Empty,
    /// Longer than any message we know
    TooLong(usize),
}

/// Fixed capacity ring of received messages
pub struct InboundRing<const N: usize = INBOX_SIZE> {
    slots: [Envelope; N],
    write_idx: usize,
}

impl<const N: usize> Default for InboundRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> InboundRing<N> {
    /// Create an empty ring
    pub const fn new() -> Self {
        Self {
            slots: [Envelope::EMPTY; N],
            write_idx: 0,
        }
    }

    /// Store a message, overwriting the oldest unread one if full.
    ///
    /// Returns `Ok(true)` if an unread message was overwritten.
    pub fn push(&mut self, sender: u8, payload: &[u8]) -> Result<bool, PushError> {
        if payload.is_empty() {
            return Err(PushError::Empty);
        }
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(PushError::TooLong(payload.len()));
        }

        let mut env = Envelope::EMPTY;
        env.data[..payload.len()].copy_from_slice(payload);
        env.sender = sender;
        env.len = payload.len() as u8;

        let slot = &mut self.slots[self.write_idx];
        let overwrote = !slot.is_empty();
        *slot = env;
        self.write_idx = (self.write_idx + 1) % N;
        Ok(overwrote)
    }

    /// Take the oldest unread message, emptying its slot
    pub fn take_next(&mut self) -> Option<Envelope> {
        let start = self.write_idx;
        (0..N)
            .map(|cc| (start + cc) % N)
            .find(|&c| !self.slots[c].is_empty())
            .map(|c| core::mem::replace(&mut self.slots[c], Envelope::EMPTY))
    }

    /// Number of unread messages
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    /// Borrow the raw slot at `idx`, for diagnostics
    pub fn slot(&self, idx: usize) -> Option<&Envelope> {
        self.slots.get(idx)
    }
}

/// An [`InboundRing`] that can be shared between the bus receive callback
/// and the main loop
///
/// The lock is only held to copy a single message in or out, never while a
/// message is being handled.
///
/// ```rust
/// use damper_node::inbox::Inbox;
/// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
///
/// static INBOX: Inbox<CriticalSectionRawMutex> = Inbox::new();
/// ```
pub struct Inbox<M: RawMutex, const N: usize = INBOX_SIZE> {
    ring: Mutex<M, RefCell<InboundRing<N>>>,
}

impl<M: RawMutex, const N: usize> Default for Inbox<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const N: usize> Inbox<M, N> {
    /// Create an empty inbox
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(RefCell::new(InboundRing::new())),
        }
    }

    /// Receive callback side: store a message. Never waits.
    pub fn push(&self, sender: u8, payload: &[u8]) {
        match self.ring.lock(|r| r.borrow_mut().push(sender, payload)) {
            Ok(false) => {}
            Ok(true) => {
                node_warn!("inbox full, dropped oldest message");
            }
            Err(PushError::Empty) => {
                node_trace!("ignoring empty message from {=u8}", sender);
            }
            Err(PushError::TooLong(len)) => {
                node_warn!("ignoring {=usize} byte message from {=u8}", len, sender);
            }
        }
    }

    /// Main loop side: take the oldest unread message
    pub fn take_next(&self) -> Option<Envelope> {
        self.ring.lock(|r| r.borrow_mut().take_next())
    }

    /// Number of unread messages
    pub fn pending(&self) -> usize {
        self.ring.lock(|r| r.borrow().pending())
    }
}
