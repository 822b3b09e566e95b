//! # Damper Node
//!
//! This is the firmware core of a damper controller node. Each node drives up
//! to three motorized air dampers (with an endstop sensor each), a main fan and
//! a laminar-flow fan, and talks to its peers over a shared, half-duplex,
//! multi-drop bus where nothing is acknowledged.
//!
//! Hardware is reached only through the traits in this crate:
//!
//! * [`Bus`]: send a message, pump the receiver, acquire an address
//! * [`MotorDriver`]: switch a damper motor
//! * [`FanDriver`]: switch a fan
//! * [`settings::SettingsStore`]: load/save the persisted settings record
//!
//! ## Addressing
//!
//! Addresses are one byte. `0` is the broadcast address, `1..=254` are node
//! addresses, and `255` marks a node that has no address yet. Address `1` is
//! special: it is taken by the node running a renumbering round (the "master
//! of ids"), and chaincast messages always start from it.
//!
//! ## Messages
//!
//! Every message is one tag byte followed by a payload of fixed length. The
//! length of a message is fully determined by its tag, and any message whose
//! received length does not match is dropped without reply. See
//! [`message`] for the layouts.
//!
//! ## Chaincast
//!
//! Broadcasts on the bus are unacknowledged and turned out to be unreliable.
//! Commands that must reach every node (damper targets, settings) are instead
//! "chaincast": the message walks up the line of sequentially numbered nodes,
//! each node OR-ing its capability bits into the `reach` field. Once `reach`
//! is full, every participant has seen the message, and it walks back down to
//! node 1. Side effects that need fleet-wide agreement (switching the fan on)
//! only happen on that second, downward pass. See [`chaincast`].
//!
//! ## Renumbering
//!
//! Chaincast needs dense, sequential addresses starting at 1. A node can be
//! told (by an operator) to become the master of ids: it takes address 1,
//! tells everyone else to re-acquire an address, asks who is out there, and
//! then moves every node into a dense sequence `2, 3, 4, ...`. See [`ids`]
//! and [`node::Node::become_master_of_ids()`].
//!
//! ## Execution contexts
//!
//! There are three:
//!
//! 1. A periodic timer interrupt, running [`damper::DamperTicker::tick()`]
//! 2. An edge-triggered endstop interrupt, calling
//!    [`damper::EndstopSignal::trigger()`]
//! 3. The cooperative main loop, calling [`node::Node::poll()`]
//!
//! The state shared between them is split by [`damper::DamperStorage::take()`]
//! into one handle per context, so each field has exactly one writer and one
//! reader (or clearer). Nothing blocks in interrupt context and no locks are
//! taken there. Only `load` and `store` atomics are used, so targets without
//! CAS atomics work.
//!
//! Received messages are handed from the bus receive callback to the main
//! loop through a tiny [`inbox::Inbox`], which overwrites the oldest message
//! when full rather than make the callback wait.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod chaincast;
pub mod console;
pub mod damper;
pub mod fan;
pub mod ids;
pub mod inbox;
pub mod message;
pub mod node;
pub mod settings;

pub use crate::fan::Fan;
pub use crate::node::{Node, NodeCfg};

/// The broadcast address
pub const BROADCAST: u8 = 0;

/// The address value used for "no address assigned yet"
pub const UNASSIGNED: u8 = 255;

/// The number of dampers a single node can drive
pub const NUM_DAMPERS: usize = 3;

/// The longest message on the wire, in bytes, including the tag
pub const MAX_MESSAGE_LEN: usize = 10;

/// A node address in the range `1..=254`
///
/// Broadcast (`0`) and unassigned (`255`) are not device ids, and are
/// represented as [`BROADCAST`] and `Option::<DeviceId>::None` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct DeviceId(u8);

impl DeviceId {
    /// The id taken by the node running a renumbering round
    pub const MASTER: DeviceId = DeviceId(1);
    /// The lowest valid id
    pub const MIN: u8 = 1;
    /// The highest valid id
    pub const MAX: u8 = 254;

    /// Create a device id, returning `None` for broadcast or unassigned values
    pub const fn new(raw: u8) -> Option<Self> {
        if raw >= Self::MIN && raw <= Self::MAX {
            Some(DeviceId(raw))
        } else {
            None
        }
    }

    /// The raw address byte
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Is this the renumbering master's id?
    #[inline]
    pub const fn is_master(self) -> bool {
        self.0 == Self::MASTER.0
    }
}

impl From<DeviceId> for u8 {
    fn from(val: DeviceId) -> Self {
        val.0
    }
}

/// The raw address byte of an optional id, [`UNASSIGNED`] for `None`
#[inline]
pub fn raw_id(id: Option<DeviceId>) -> u8 {
    id.map(DeviceId::get).unwrap_or(UNASSIGNED)
}

/// An error type for the [`Bus`] trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying bus transport
    Bus(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Bus(value)
    }
}

/// A trait representing the shared, multi-drop bus transport
///
/// The transport does its own framing and addressing. Nothing sent over it is
/// acknowledged at this layer.
pub trait Bus {
    /// The error type of the underlying transport
    type BusError;

    /// Send one message to `dest`, which may be [`BROADCAST`].
    fn send(&mut self, dest: u8, payload: &[u8]) -> Result<(), Error<Self::BusError>>;

    /// Give the transport a chance to do its work.
    ///
    /// Every message received during this call must be handed to `deliver`
    /// as `(sender_id, payload)`. A sender id of [`BROADCAST`] means the
    /// message was a broadcast. `deliver` returns immediately.
    fn pump(&mut self, deliver: &mut dyn FnMut(u8, &[u8]));

    /// Ask the transport to find a free address and take it.
    ///
    /// Returns the address now in use, or `None` if acquisition failed.
    fn acquire_id(&mut self) -> Option<DeviceId>;

    /// Set (or clear) the address the transport listens on.
    fn set_id(&mut self, id: Option<DeviceId>);
}

/// Damper motor outputs, driven from the timer interrupt
pub trait MotorDriver {
    /// Energize (`true`) or de-energize (`false`) the motor of `damper`.
    fn set_motor(&mut self, damper: usize, run: bool);
}

/// Fan outputs, driven from the main loop
pub trait FanDriver {
    /// Switch `fan` on (`true`) or off (`false`).
    fn set_fan(&mut self, fan: Fan, run: bool);
}
