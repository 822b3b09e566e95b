//! Device id management
//!
//! Every node needs an address for chaincast to work, and chaincast needs
//! those addresses to be dense and sequential, starting at 1. Addresses come
//! from two places:
//!
//! * The bus transport's own "acquire a free address" primitive, used at
//!   boot (if nothing was persisted) and when told to via `IdDoAuto`
//! * A renumbering round run by the "master of ids", which moves everyone
//!   into a dense sequence with `IdSet` messages
//!
//! A renumbering round, as seen from the master:
//!
//! 1. Take address 1, persist it, broadcast `IdDoAuto`
//! 2. Let the bus run for a while so everyone can re-acquire an address
//! 3. Clear the [`IdRenumberList`], broadcast `IdQuestion`
//! 4. Let the bus run again, collecting the `IdInfo` replies
//! 5. [`IdRenumberList::plan()`], and send one `IdSet` per planned move
//!
//! Nodes whose address is already right get no message at all, so running a
//! round on a well numbered fleet changes nothing.

use embassy_time::{block_for, Duration};
use heapless::Vec;

use crate::{Bus, DeviceId, BROADCAST};

/// Maximum number of nodes discovered in one renumbering round
pub const ID_LIST_LEN: usize = 10;

/// Who we are, and where our telemetry goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Our address, `None` while unassigned
    pub device_id: Option<DeviceId>,
    /// Destination of pressure and error telemetry
    pub telemetry_destination: u8,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            device_id: None,
            telemetry_destination: BROADCAST,
        }
    }
}

/// One `IdSet` to send during renumbering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reassign {
    /// The node's current address
    pub from: u8,
    /// The address it should take
    pub to: u8,
}

/// The ids heard during a single renumbering round
#[derive(Debug, Default)]
pub struct IdRenumberList {
    ids: Vec<u8, ID_LIST_LEN>,
}

impl IdRenumberList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// Forget everything, for the start of a round
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Note that `id` is out there.
    ///
    /// Returns `false` if the list was already full and the id was dropped.
    /// Those nodes will not be renumbered this round.
    pub fn add(&mut self, id: DeviceId) -> bool {
        let id = id.get();
        if self.ids.contains(&id) {
            return true;
        }
        self.ids.push(id).is_ok()
    }

    /// Number of distinct ids heard
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Have we heard nobody?
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The ids, in the order they were heard
    pub fn as_slice(&self) -> &[u8] {
        &self.ids
    }

    /// Work out which nodes have to move to make the ids `1, 2, 3, ...`
    ///
    /// The ids are sorted, and the node at sorted position `i` should have
    /// id `i + 1`. Nodes that already do are left out.
    pub fn plan(&self) -> Vec<Reassign, ID_LIST_LEN> {
        let mut sorted = self.ids.clone();
        sorted.sort_unstable();
        sorted
            .iter()
            .zip(1u8..)
            .filter(|(from, to)| **from != *to)
            .map(|(from, to)| Reassign { from: *from, to })
            .collect()
    }
}

/// Ask the bus for an address, retrying once after `settle`.
///
/// With `exclude_master`, getting address 1 counts as a failure: it is
/// reserved for the node running a renumbering round.
pub fn acquire<B: Bus>(bus: &mut B, settle: Duration, exclude_master: bool) -> Option<DeviceId> {
    let usable = |id: Option<DeviceId>| id.filter(|i| !(exclude_master && i.is_master()));

    if let Some(id) = usable(bus.acquire_id()) {
        return Some(id);
    }

    node_info!("no usable id yet, retrying");
    block_for(settle);
    let got = usable(bus.acquire_id());
    if got.is_none() {
        node_warn!("id acquisition failed, staying unaddressed");
        // The transport may be sitting on the reserved id
        bus.set_id(None);
    }
    got
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn dev(raw: u8) -> DeviceId {
        DeviceId::new(raw).unwrap()
    }

    struct ScriptedBus {
        answers: [Option<u8>; 2],
        calls: usize,
        id: Option<DeviceId>,
    }

    impl Bus for ScriptedBus {
        type BusError = ();

        fn send(&mut self, _dest: u8, _payload: &[u8]) -> Result<(), Error<()>> {
            Ok(())
        }

        fn pump(&mut self, _deliver: &mut dyn FnMut(u8, &[u8])) {}

        fn acquire_id(&mut self) -> Option<DeviceId> {
            let answer = self.answers.get(self.calls).copied().flatten();
            self.calls += 1;
            self.id = answer.and_then(DeviceId::new);
            self.id
        }

        fn set_id(&mut self, id: Option<DeviceId>) {
            self.id = id;
        }
    }

    fn bus(answers: [Option<u8>; 2]) -> ScriptedBus {
        ScriptedBus {
            answers,
            calls: 0,
            id: None,
        }
    }

    #[test]
    fn plan_compresses_gaps() {
        let mut list = IdRenumberList::new();
        for id in [7, 1, 5] {
            assert!(list.add(dev(id)));
        }
        let plan = list.plan();
        assert_eq!(
            plan.as_slice(),
            &[Reassign { from: 5, to: 2 }, Reassign { from: 7, to: 3 }]
        );
    }

    #[test]
    fn sequential_fleet_needs_no_moves() {
        let mut list = IdRenumberList::new();
        for id in [3, 1, 2, 4] {
            list.add(dev(id));
        }
        assert!(list.plan().is_empty());
    }

    #[test]
    fn list_caps_at_ten() {
        let mut list = IdRenumberList::new();
        for id in 1..=ID_LIST_LEN as u8 {
            assert!(list.add(dev(id * 2)));
        }
        assert!(!list.add(dev(200)));
        assert_eq!(list.len(), ID_LIST_LEN);
        assert!(!list.as_slice().contains(&200));

        // Duplicates don't take up room
        assert!(list.add(dev(2)));
        assert_eq!(list.len(), ID_LIST_LEN);

        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn acquire_first_try() {
        let mut b = bus([Some(4), Some(9)]);
        assert_eq!(acquire(&mut b, Duration::from_ticks(0), true), DeviceId::new(4));
        assert_eq!(b.calls, 1);
    }

    #[test]
    fn acquire_retries_once() {
        let mut b = bus([None, Some(9)]);
        assert_eq!(acquire(&mut b, Duration::from_ticks(0), false), DeviceId::new(9));
        assert_eq!(b.calls, 2);
    }

    #[test]
    fn acquire_refuses_master_id() {
        let mut b = bus([Some(1), Some(1)]);
        assert_eq!(acquire(&mut b, Duration::from_ticks(0), true), None);
        assert_eq!(b.calls, 2);
        assert_eq!(b.id, None);

        let mut b = bus([Some(1), Some(6)]);
        assert_eq!(acquire(&mut b, Duration::from_ticks(0), true), DeviceId::new(6));

        let mut b = bus([Some(1), Some(6)]);
        assert_eq!(acquire(&mut b, Duration::from_ticks(0), false), Some(DeviceId::MASTER));
    }
}
