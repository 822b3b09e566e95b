//! The node
//!
//! [`Node`] owns all main-loop state of a damper controller: its identity,
//! the bus, the settings store, the fans, and the main loop's handle to the
//! dampers. It is intended to be used in three places:
//!
//! 1. The main loop, calling [`Node::poll()`] over and over
//! 2. The bus receive callback, which (through [`Bus::pump()`]) only ever
//!    touches the shared [`Inbox`]
//! 3. Operator actions (console, buttons), calling things like
//!    [`Node::send_damper_cmd()`] or [`Node::become_master_of_ids()`]
//!
//! The timer and endstop interrupts never see the `Node`, only their own
//! [`DamperTicker`][crate::damper::DamperTicker] and
//! [`EndstopSignal`][crate::damper::EndstopSignal] handles.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{block_for, Duration, Instant};
use heapless::Vec;

use crate::{
    chaincast::{self, Participants},
    console::ConsoleCommand,
    damper::DamperControl,
    fan::{FanControl, FanState},
    ids::{self, IdRenumberList, NodeIdentity, Reassign, ID_LIST_LEN},
    inbox::{Envelope, Inbox, INBOX_SIZE},
    message::{
        Chaincast, DamperCmd, DamperPosition, ErrorInfo, ErrorKind, Message, PressureInfo,
        UpdateSettings,
    },
    settings::{Settings, SettingsStore, RECORD_LEN},
    Bus, DeviceId, Error, Fan, BROADCAST, NUM_DAMPERS,
};

/// Metadata trait to contain relevant generics and tunables
pub trait NodeCfg {
    /// Mutex type used for the shared inbox
    type Mutex: RawMutex + 'static;

    /// Bus transport
    type Bus: Bus;

    /// Persisted settings storage
    type Store: SettingsStore;

    /// Fan outputs
    type Fans: crate::FanDriver;

    /// Chaincast participants. Each node contributes the bits of its
    /// installed dampers.
    const PARTICIPANTS: Participants = Participants::DAMPERS;

    /// Time to wait before retrying a failed id acquisition
    const ACQUIRE_SETTLE: Duration = Duration::from_millis(100);

    /// Time to let the bus settle after hearing `IdDoAuto`, before
    /// acquiring a new id
    const AUTO_ID_SETTLE: Duration = Duration::from_millis(200);

    /// How long the master lets the bus run after `IdDoAuto`, so everyone
    /// can re-acquire an id
    const REACQUIRE_WINDOW: Duration;

    /// How long the master collects `IdInfo` replies after `IdQuestion`
    const DISCOVERY_WINDOW: Duration;

    /// If the number of nodes is known (master included), stop collecting
    /// replies as soon as that many were heard
    const EXPECTED_NODES: Option<u8> = None;

    /// The damper that belongs to the laminar flow fan
    const LAMINAR_DAMPER: usize = 1;
}

type BusResult<Cfg, T> = Result<T, Error<<<Cfg as NodeCfg>::Bus as Bus>::BusError>>;

/// Diagnostic snapshot of one damper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamperStatus {
    /// Is it installed?
    pub installed: bool,
    /// Open position calibration
    pub open_position: u8,
    /// Estimated position
    pub current: u8,
    /// Target position
    pub target: u8,
    /// An endstop transit is waiting for the next tick
    pub endstop_pending: bool,
}

/// Diagnostic snapshot of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    /// Identity and telemetry destination
    pub identity: NodeIdentity,
    /// Per damper state
    pub dampers: [DamperStatus; NUM_DAMPERS],
    /// Main fan target
    pub fan_target: FanState,
    /// Laminar fan target
    pub laminar_target: FanState,
    /// Main fan should be running now
    pub fan_running: bool,
    /// Laminar fan should be running now
    pub laminar_running: bool,
}

/// A damper controller node
pub struct Node<'a, Cfg, const IN: usize = INBOX_SIZE>
where
    Cfg: NodeCfg,
{
    bus: Cfg::Bus,
    store: Cfg::Store,
    fans: Cfg::Fans,
    inbox: &'a Inbox<Cfg::Mutex, IN>,
    dampers: DamperControl<'a>,
    fan_ctl: FanControl,
    identity: NodeIdentity,
    discovered: IdRenumberList,
}

/// Instantiation and boot
impl<'a, Cfg, const IN: usize> Node<'a, Cfg, IN>
where
    Cfg: NodeCfg,
{
    /// Create a node, loading the persisted settings from `store`
    ///
    /// This does not touch the bus yet, call [`Node::boot()`] for that.
    pub fn new(
        bus: Cfg::Bus,
        mut store: Cfg::Store,
        fans: Cfg::Fans,
        inbox: &'a Inbox<Cfg::Mutex, IN>,
        mut dampers: DamperControl<'a>,
    ) -> Self {
        let mut raw = [0u8; RECORD_LEN];
        let settings = match store.load(&mut raw) {
            Ok(()) => Settings::recover(&raw),
            Err(_) => {
                node_warn!("couldn't load settings, using defaults");
                Settings::default()
            }
        };
        dampers.set_open_positions(settings.open_positions);
        dampers.set_installed_mask(settings.installed_mask);

        Self {
            bus,
            store,
            fans,
            inbox,
            dampers,
            fan_ctl: FanControl::new(),
            identity: NodeIdentity {
                device_id: settings.device_id,
                ..NodeIdentity::default()
            },
            discovered: IdRenumberList::new(),
        }
    }

    /// Bring up the bus address
    ///
    /// Uses the persisted id if there is one. Otherwise asks the bus for a
    /// free one (retrying once), and persists it on success. Failing to get
    /// an id is not fatal: the node just can't be addressed until the next
    /// renumbering round.
    pub fn boot(&mut self) {
        if let Some(id) = self.identity.device_id {
            node_info!("booting with persisted id {=u8}", id.get());
            self.bus.set_id(Some(id));
            return;
        }

        match ids::acquire(&mut self.bus, Cfg::ACQUIRE_SETTLE, false) {
            Some(id) => {
                node_info!("acquired id {=u8}", id.get());
                self.identity.device_id = Some(id);
                self.persist();
            }
            None => {
                node_error!("booting without an id");
            }
        }
    }
}

/// Accessors
impl<'a, Cfg, const IN: usize> Node<'a, Cfg, IN>
where
    Cfg: NodeCfg,
{
    /// Our identity
    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    /// Our address, `None` while unassigned
    pub fn device_id(&self) -> Option<DeviceId> {
        self.identity.device_id
    }

    /// The main loop's damper handle
    pub fn dampers(&self) -> &DamperControl<'a> {
        &self.dampers
    }

    /// The fan targets
    pub fn fan_control(&self) -> &FanControl {
        &self.fan_ctl
    }

    /// The ids heard in the current (or last) renumbering round
    pub fn discovered(&self) -> &IdRenumberList {
        &self.discovered
    }

    /// Borrow the bus transport
    pub fn bus(&self) -> &Cfg::Bus {
        &self.bus
    }

    /// Mutably borrow the bus transport
    pub fn bus_mut(&mut self) -> &mut Cfg::Bus {
        &mut self.bus
    }

    /// Borrow the settings store
    pub fn store(&self) -> &Cfg::Store {
        &self.store
    }

    /// Diagnostic snapshot
    pub fn status(&self) -> NodeStatus {
        let open = self.dampers.open_positions();
        let dampers = core::array::from_fn(|d| DamperStatus {
            installed: self.dampers.is_installed(d),
            open_position: open[d],
            current: self.dampers.current(d),
            target: self.dampers.target(d),
            endstop_pending: self.dampers.endstop_pending(d),
        });
        NodeStatus {
            identity: self.identity,
            dampers,
            fan_target: self.fan_ctl.target(Fan::Main),
            laminar_target: self.fan_ctl.target(Fan::Laminar),
            fan_running: self.fan_ctl.main_runs(&self.dampers),
            laminar_running: self.fan_ctl.laminar_runs(&self.dampers, Cfg::LAMINAR_DAMPER),
        }
    }
}

/// Main loop tasks
impl<'a, Cfg, const IN: usize> Node<'a, Cfg, IN>
where
    Cfg: NodeCfg,
{
    /// One pass of the main loop
    ///
    /// Pumps the bus, handles everything received, switches the fans, and
    /// reports damper faults.
    pub fn poll(&mut self) {
        self.pump_bus();
        self.process_inbox();
        self.control_fans();
        self.poll_faults();
    }

    /// Let the bus transport run, storing anything received in the inbox
    pub fn pump_bus(&mut self) {
        let inbox = self.inbox;
        self.bus
            .pump(&mut |sender, payload| inbox.push(sender, payload));
    }

    /// Handle received messages, oldest first
    ///
    /// At most one inbox worth of messages is handled per call. Returns the
    /// number of messages taken from the inbox.
    pub fn process_inbox(&mut self) -> usize {
        let mut handled = 0;
        while handled < IN {
            let Some(env) = self.inbox.take_next() else {
                break;
            };
            handled += 1;
            self.handle_envelope(&env);
        }
        handled
    }

    /// Switch the fans according to targets and damper positions
    pub fn control_fans(&mut self) {
        self.fan_ctl
            .drive(&self.dampers, Cfg::LAMINAR_DAMPER, &mut self.fans);
    }

    /// Report (and clear) damper overflow faults
    pub fn poll_faults(&mut self) {
        for d in 0..NUM_DAMPERS {
            if !self.dampers.take_overflow(d) {
                continue;
            }
            node_error!("damper {=usize} never reached its endstop", d);
            let msg = Message::Error(ErrorInfo {
                damper_id: d as u8,
                kind: ErrorKind::Timeout,
            });
            let dest = self.identity.telemetry_destination;
            if self.send(dest, &msg).is_err() {
                node_warn!("couldn't report damper timeout");
            }
        }
    }

    fn handle_envelope(&mut self, env: &Envelope) {
        match Message::decode(env.payload()) {
            Ok(msg) => self.dispatch(env.sender(), msg),
            Err(_e) => {
                node_warn!(
                    "dropping bad message from {=u8}, {=usize} bytes",
                    env.sender(),
                    env.payload().len()
                );
            }
        }
    }
}

/// Message dispatch
impl<'a, Cfg, const IN: usize> Node<'a, Cfg, IN>
where
    Cfg: NodeCfg,
{
    /// Route one decoded message to its handler
    pub fn dispatch(&mut self, sender: u8, msg: Message) {
        match msg {
            Message::DamperCmd(cc) => self.on_damper_cmd(sender, cc),
            Message::UpdateSettings(cc) => self.on_update_settings(sender, cc),
            Message::PressureInfo(_pi) => {
                node_trace!("pressure info from {=u8}", sender);
            }
            Message::Error(ei) => {
                node_info!("error report from {=u8} for damper {=u8}", sender, ei.damper_id);
            }
            Message::IdDoAuto => self.on_do_auto(),
            Message::IdQuestion => self.on_question(sender),
            Message::IdInfo { id } => self.on_info(sender, id),
            Message::IdSet { id } => self.on_set(id),
        }
    }

    fn capabilities(&self) -> u8 {
        self.dampers.installed_mask() & Cfg::PARTICIPANTS.full_mask()
    }

    fn on_damper_cmd(&mut self, sender: u8, mut cc: Chaincast<DamperCmd>) {
        let hop = chaincast::accept(
            &mut cc,
            self.capabilities(),
            Cfg::PARTICIPANTS,
            sender,
            self.identity.device_id,
        );
        node_debug!(
            "damper cmd from {=u8}, reach {=u8}, all: {=bool}",
            sender,
            cc.reach,
            hop.did_reach_all
        );

        // Dampers start moving as early as possible, the fans only once
        // everyone has the command.
        self.dampers.apply(&cc.body);
        if hop.did_reach_all {
            self.fan_ctl.set_targets(cc.body.fan, cc.body.laminar);
        }
        self.forward(hop.next, &Message::DamperCmd(cc));
    }

    fn on_update_settings(&mut self, sender: u8, mut cc: Chaincast<UpdateSettings>) {
        let hop = chaincast::accept(
            &mut cc,
            self.capabilities(),
            Cfg::PARTICIPANTS,
            sender,
            self.identity.device_id,
        );
        node_debug!("settings from {=u8}, reach {=u8}", sender, cc.reach);

        if self.dampers.set_open_positions(cc.body.open_positions) {
            self.persist();
        }
        self.forward(hop.next, &Message::UpdateSettings(cc));
    }

    fn forward(&mut self, next: Option<DeviceId>, msg: &Message) {
        let Some(next) = next else {
            return;
        };
        node_trace!("chaincast forward to {=u8}", next.get());
        if self.send(next.get(), msg).is_err() {
            node_warn!("chaincast forward to {=u8} failed", next.get());
        }
    }

    fn on_do_auto(&mut self) {
        block_for(Cfg::AUTO_ID_SETTLE);
        self.bus.set_id(None);
        self.identity.device_id = ids::acquire(&mut self.bus, Cfg::ACQUIRE_SETTLE, true);
        match self.identity.device_id {
            Some(id) => {
                node_info!("re-acquired id {=u8}", id.get());
                self.persist();
            }
            None => {
                node_error!("lost our id, unaddressable until renumbered");
            }
        }
    }

    fn on_question(&mut self, sender: u8) {
        let Some(own) = self.identity.device_id else {
            node_warn!("asked for our id, but we have none");
            return;
        };
        // Broadcast questions come from the master
        let asker = if sender == BROADCAST {
            DeviceId::MASTER.get()
        } else {
            sender
        };
        let msg = Message::IdInfo { id: own.get() };
        if self.send(asker, &msg).is_err() {
            node_warn!("couldn't answer id question");
        }
    }

    fn on_info(&mut self, sender: u8, id: u8) {
        let raw = if sender == BROADCAST { id } else { sender };
        let Some(who) = DeviceId::new(raw) else {
            node_warn!("ignoring id info for invalid id {=u8}", raw);
            return;
        };
        if !self.discovered.add(who) {
            node_warn!("id list full, {=u8} won't be renumbered", who.get());
        }
    }

    fn on_set(&mut self, id: u8) {
        match DeviceId::new(id) {
            Some(id) => {
                node_info!("told to take id {=u8}", id.get());
                self.set_device_id(Some(id));
            }
            None => {
                node_warn!("ignoring invalid id {=u8}", id);
            }
        }
    }
}

/// Operator actions
impl<'a, Cfg, const IN: usize> Node<'a, Cfg, IN>
where
    Cfg: NodeCfg,
{
    /// Take (or drop) an address, and persist it
    pub fn set_device_id(&mut self, id: Option<DeviceId>) {
        self.identity.device_id = id;
        self.bus.set_id(id);
        self.persist();
    }

    /// Set which dampers are installed, and persist it
    pub fn set_installed_mask(&mut self, mask: u8) {
        self.dampers.set_installed_mask(mask);
        self.persist();
    }

    /// Set where pressure and error telemetry goes
    pub fn set_telemetry_destination(&mut self, dest: u8) {
        self.identity.telemetry_destination = dest;
    }

    /// Send a raw message to `dest`
    ///
    /// If the message is for us (or a broadcast) it is also delivered to our
    /// own inbox. If it is for anyone else (or a broadcast) it goes on the
    /// bus.
    pub fn inject(&mut self, dest: u8, payload: &[u8]) -> BusResult<Cfg, ()> {
        let own = self.identity.device_id.map(DeviceId::get);
        let for_us = dest == BROADCAST || own == Some(dest);
        if for_us {
            let sender = if dest == BROADCAST {
                BROADCAST
            } else {
                dest
            };
            self.inbox.push(sender, payload);
        }
        if dest == BROADCAST || !for_us {
            self.bus.send(dest, payload)?;
        }
        Ok(())
    }

    /// Start a chaincast damper command
    ///
    /// The command starts at node 1 with an empty reach field, wherever on
    /// the bus we are.
    pub fn send_damper_cmd(&mut self, cmd: DamperCmd) -> BusResult<Cfg, ()> {
        let msg = Message::DamperCmd(Chaincast { reach: 0, body: cmd });
        self.inject(DeviceId::MASTER.get(), &msg.encode())
    }

    /// Start a chaincast calibration update
    pub fn send_update_settings(&mut self, open_positions: [u8; NUM_DAMPERS]) -> BusResult<Cfg, ()> {
        let msg = Message::UpdateSettings(Chaincast {
            reach: 0,
            body: UpdateSettings { open_positions },
        });
        self.inject(DeviceId::MASTER.get(), &msg.encode())
    }

    /// Tell every other node to re-acquire an id
    pub fn broadcast_auto_id(&mut self) -> BusResult<Cfg, ()> {
        self.send(BROADCAST, &Message::IdDoAuto)
    }

    /// Send a pressure reading to the telemetry destination
    pub fn report_pressure(&mut self, sensor_id: u8, celsius: f32, pascal: f32) -> BusResult<Cfg, ()> {
        let msg = Message::PressureInfo(PressureInfo {
            sensor_id,
            celsius,
            pascal,
        });
        self.send(self.identity.telemetry_destination, &msg)
    }

    /// Become node 1, and renumber everyone else into `2, 3, 4, ...`
    ///
    /// This blocks the main loop for up to
    /// [`NodeCfg::REACQUIRE_WINDOW`] + [`NodeCfg::DISCOVERY_WINDOW`], while
    /// still pumping the bus and handling messages. Returns the moves that
    /// were sent.
    pub fn become_master_of_ids(&mut self) -> BusResult<Cfg, Vec<Reassign, ID_LIST_LEN>> {
        self.set_device_id(Some(DeviceId::MASTER));
        self.send(BROADCAST, &Message::IdDoAuto)?;
        self.pump_for(Cfg::REACQUIRE_WINDOW, None);

        self.discovered.clear();
        self.discovered.add(DeviceId::MASTER);
        self.send(BROADCAST, &Message::IdQuestion)?;
        self.pump_for(Cfg::DISCOVERY_WINDOW, Cfg::EXPECTED_NODES);

        let plan = self.discovered.plan();
        node_info!(
            "heard {=usize} ids, moving {=usize}",
            self.discovered.len(),
            plan.len()
        );
        for r in plan.iter() {
            node_info!("renumbering {=u8} -> {=u8}", r.from, r.to);
            self.send(r.from, &Message::IdSet { id: r.to })?;
        }
        Ok(plan)
    }

    /// Apply a decoded console command
    ///
    /// [`ConsoleCommand::ResetToBootloader`] is left to the application.
    pub fn apply_console(&mut self, cmd: ConsoleCommand) -> BusResult<Cfg, ()> {
        match cmd {
            ConsoleCommand::SetDeviceId(raw) => self.set_device_id(DeviceId::new(raw)),
            ConsoleCommand::SetInstalledMask(mask) => self.set_installed_mask(mask),
            ConsoleCommand::Dampers(pos) => {
                let fan = FanState::from_bit(pos != DamperPosition::Closed);
                self.send_damper_cmd(DamperCmd {
                    dampers: [pos; NUM_DAMPERS],
                    fan,
                    laminar: fan,
                })?;
            }
            ConsoleCommand::BecomeMaster => {
                self.become_master_of_ids()?;
            }
            ConsoleCommand::BroadcastAutoId => self.broadcast_auto_id()?,
            ConsoleCommand::Inject { dest, payload } => self.inject(dest, &payload)?,
            ConsoleCommand::DumpState => self.dump_state(),
            ConsoleCommand::ResetToBootloader => {}
        }
        Ok(())
    }

    fn dump_state(&self) {
        let status = self.status();
        node_println!("=== State ===");
        node_println!("device id: {=u8}", crate::raw_id(status.identity.device_id));
        node_println!("telemetry dest: {=u8}", status.identity.telemetry_destination);
        for (d, ds) in status.dampers.iter().enumerate() {
            node_println!(
                "damper{=usize}: installed {=bool}, open at {=u8}, current {=u8}, target {=u8}, endstop {=bool}",
                d,
                ds.installed,
                ds.open_position,
                ds.current,
                ds.target,
                ds.endstop_pending
            );
        }
        node_println!(
            "fan running {=bool}, laminar running {=bool}",
            status.fan_running,
            status.laminar_running
        );
    }
}

/// Helpers
impl<'a, Cfg, const IN: usize> Node<'a, Cfg, IN>
where
    Cfg: NodeCfg,
{
    fn send(&mut self, dest: u8, msg: &Message) -> BusResult<Cfg, ()> {
        self.bus.send(dest, &msg.encode())
    }

    fn persist(&mut self) {
        let settings = Settings {
            device_id: self.identity.device_id,
            open_positions: self.dampers.open_positions(),
            installed_mask: self.dampers.installed_mask(),
        };
        if self.store.save(&settings.to_bytes()).is_err() {
            node_warn!("couldn't persist settings");
        }
    }

    /// Pump the bus and handle messages until `window` has passed, or
    /// `expected` ids have been discovered. Always pumps at least once.
    fn pump_for(&mut self, window: Duration, expected: Option<u8>) {
        let deadline = Instant::now() + window;
        loop {
            self.pump_bus();
            self.process_inbox();
            let enough = expected.is_some_and(|n| self.discovered.len() >= n as usize);
            if enough || Instant::now() >= deadline {
                break;
            }
        }
    }
}
