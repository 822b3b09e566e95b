//! Chaincast
//!
//! Broadcasts on the bus are not acknowledged, and in practice they are lost
//! often enough to matter. Chaincast gets a confirmation that a message has
//! reached every participant without any acknowledgements:
//!
//! 1. A chaincast message is always sent to, or originates from, node 1
//!    (the bottom of the ladder), with an empty `reach` field.
//! 2. Every node receiving it ORs its own capability bits into `reach`, handles
//!    the message, and forwards it to `own_id + 1` (climbing the ladder).
//! 3. Once `reach` holds every participant bit, each node handles it knowing
//!    that everyone has seen the message, and forwards it to `own_id - 1`
//!    (descending the ladder) until it arrives back at node 1.
//!
//! This only works if node ids are dense and sequential, which is what
//! [`Node::become_master_of_ids()`][crate::Node::become_master_of_ids] is for.
//!
//! `reach` only ever gains bits along the way. Only the originator starts
//! with an empty one.

use crate::{message::Chaincast, DeviceId, BROADCAST};

/// The number of participant bits in a reach field
///
/// On a fleet of three damper nodes, each bit stands for one damper
/// position, and every node contributes the bits of the dampers it has
/// installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participants {
    count: u8,
}

impl Participants {
    /// Three participants, one per damper
    pub const DAMPERS: Participants = Participants { count: 3 };

    /// Between one and eight participants
    pub const fn new(count: u8) -> Option<Self> {
        if count >= 1 && count <= 8 {
            Some(Participants { count })
        } else {
            None
        }
    }

    /// The number of participants
    pub const fn count(self) -> u8 {
        self.count
    }

    /// The reach value meaning "everyone has seen it"
    pub const fn full_mask(self) -> u8 {
        if self.count >= 8 {
            0xFF
        } else {
            (1u8 << self.count) - 1
        }
    }

    /// Does `reach` contain every participant bit?
    pub const fn did_reach_all(self, reach: u8) -> bool {
        let full = self.full_mask();
        reach & full == full
    }
}

/// The outcome of accepting one chaincast reception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    /// Every participant has seen this message
    pub did_reach_all: bool,
    /// Where to forward the (updated) message, if anywhere
    pub next: Option<DeviceId>,
}

/// Mark a received chaincast message as seen by us, and work out where it
/// goes next.
///
/// `capabilities` are our own participant bits, `sender` is who we got the
/// message from, and `own_id` is our address. Broadcast chaincasts are never
/// forwarded, and neither are messages received while we have no address.
pub fn accept<T>(
    msg: &mut Chaincast<T>,
    capabilities: u8,
    participants: Participants,
    sender: u8,
    own_id: Option<DeviceId>,
) -> Hop {
    msg.reach |= capabilities;
    let did_reach_all = participants.did_reach_all(msg.reach);
    Hop {
        did_reach_all,
        next: next_hop(sender, own_id, did_reach_all),
    }
}

/// The next node on the ladder
///
/// Up while the message has not reached everyone, down once it has. `None`
/// at the bottom of the ladder, for broadcasts, and when we have no id.
pub fn next_hop(sender: u8, own_id: Option<DeviceId>, did_reach_all: bool) -> Option<DeviceId> {
    if sender == BROADCAST {
        return None;
    }
    let own = own_id?.get();
    let next = if did_reach_all {
        own.checked_sub(1)?
    } else {
        own.checked_add(1)?
    };
    DeviceId::new(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u8) -> Option<DeviceId> {
        DeviceId::new(raw)
    }

    #[test]
    fn masks() {
        assert_eq!(Participants::DAMPERS.full_mask(), 0b111);
        assert_eq!(Participants::new(1).unwrap().full_mask(), 0b1);
        assert_eq!(Participants::new(8).unwrap().full_mask(), 0xFF);
        assert!(Participants::new(0).is_none());
        assert!(Participants::new(9).is_none());
    }

    #[test]
    fn full_exactly_when_all_three_bits_are_set() {
        let p = Participants::DAMPERS;
        for reach in 0u8..8 {
            assert_eq!(p.did_reach_all(reach), reach == 0b111, "reach {reach:03b}");
        }
    }

    #[test]
    fn reach_never_shrinks() {
        let mut msg = Chaincast { reach: 0, body: () };
        let mut last = 0;
        for caps in [0b001, 0b000, 0b100, 0b001, 0b010, 0b000] {
            accept(&mut msg, caps, Participants::DAMPERS, 1, id(2));
            assert_eq!(msg.reach & last, last);
            last = msg.reach;
        }
        assert_eq!(msg.reach, 0b111);
    }

    #[test]
    fn climbs_then_descends() {
        let mut msg = Chaincast { reach: 0, body: () };
        let hop = accept(&mut msg, 0b001, Participants::DAMPERS, 1, id(1));
        assert_eq!(hop, Hop { did_reach_all: false, next: id(2) });

        let hop = accept(&mut msg, 0b110, Participants::DAMPERS, 1, id(2));
        assert_eq!(hop, Hop { did_reach_all: true, next: id(1) });

        let hop = accept(&mut msg, 0b001, Participants::DAMPERS, 2, id(1));
        assert_eq!(hop, Hop { did_reach_all: true, next: None });
    }

    #[test]
    fn broadcasts_and_unaddressed_nodes_do_not_forward() {
        assert_eq!(next_hop(BROADCAST, id(3), false), None);
        assert_eq!(next_hop(BROADCAST, id(3), true), None);
        assert_eq!(next_hop(2, None, false), None);
    }

    #[test]
    fn top_of_the_address_space() {
        assert_eq!(next_hop(253, id(254), false), None);
        assert_eq!(next_hop(253, id(254), true), id(253));
    }
}
