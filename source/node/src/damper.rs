//! Damper position control
//!
//! Dampers have no position sensor, only an endstop at the fully closed
//! position. Position is estimated from time: every timer tick that a damper
//! motor runs, its position counter goes up by one. The counter is a `u8`,
//! and wraps.
//!
//! * `0` means fully closed, and is the only position we ever KNOW, because
//!   the endstop fires there. Every endstop transit resets the counter to 0.
//! * The calibrated open position is some tick count `0..=127`.
//! * A damper told to close just keeps running until the endstop resets its
//!   counter. If the counter instead makes it all the way to `255`, the
//!   endstop never fired, and the endstop (or the damper) is probably broken.
//!   That raises an overflow fault, which the main loop reports.
//!
//! ## Who touches what
//!
//! [`DamperStorage::take()`] hands out exactly one handle per execution
//! context, and each handle can only do what its context is allowed to:
//!
//! | Field            | Written by                        | Read / cleared by          |
//! | ---------------- | --------------------------------- | -------------------------- |
//! | `installed`      | [`DamperControl`] (main loop)     | [`DamperTicker`] (timer)   |
//! | `target`         | [`DamperControl`] (main loop)     | [`DamperTicker`] (timer)   |
//! | `current`        | [`DamperTicker`] (timer)          | [`DamperControl`] (main)   |
//! | `endstop`        | [`EndstopSignal`] (endstop IRQ)   | [`DamperTicker`] clears    |
//! | `overflow`       | [`DamperTicker`] (timer)          | [`DamperControl`] clears   |
//!
//! All fields are single bytes, and only atomic `load`s and `store`s are
//! used. The flags are cleared with a load followed by a store, so a flag
//! set in between is lost. For the endstop, that just means the reset happens
//! one transit later; it never corrupts a counter.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::{message::DamperCmd, MotorDriver, NUM_DAMPERS};

/// Default calibrated open position, in ticks
pub const DEFAULT_OPEN_POSITION: u8 = 100;

/// Highest valid open position calibration
pub const MAX_OPEN_POSITION: u8 = 127;

struct DamperCell {
    installed: AtomicBool,
    current: AtomicU8,
    target: AtomicU8,
    endstop: AtomicBool,
    overflow: AtomicBool,
}

impl DamperCell {
    #[allow(clippy::declare_interior_mutable_const)]
    const NEW: Self = DamperCell {
        installed: AtomicBool::new(false),
        current: AtomicU8::new(0),
        target: AtomicU8::new(0),
        endstop: AtomicBool::new(false),
        overflow: AtomicBool::new(false),
    };

    /// Read-and-clear, with only loads and stores
    fn take_flag(flag: &AtomicBool) -> bool {
        let set = flag.load(Ordering::Acquire);
        // Only clear what we saw set
        if set {
            flag.store(false, Ordering::Release);
        }
        set
    }
}

/// Storage for the state of all dampers
///
/// Intended for static usage.
///
/// ```rust
/// use damper_node::damper::DamperStorage;
///
/// static DAMPERS: DamperStorage = DamperStorage::new();
/// ```
pub struct DamperStorage {
    cells: [DamperCell; NUM_DAMPERS],
    once: AtomicBool,
}

impl Default for DamperStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DamperStorage {
    /// Create new damper storage: nothing installed, everything closed
    pub const fn new() -> Self {
        Self {
            cells: [DamperCell::NEW; NUM_DAMPERS],
            once: AtomicBool::new(false),
        }
    }

    /// Attempt to take the per-context handles
    ///
    /// The first call will return Some, all later calls will return None.
    /// Uses a [critical section][critical_section::with] to ensure it only
    /// works once, even on targets without atomics.
    pub fn take(&self) -> Option<(DamperControl<'_>, DamperTicker<'_>, EndstopSignal<'_>)> {
        critical_section::with(|_| {
            let old = self.once.load(Ordering::Acquire);
            self.once.store(true, Ordering::Release);
            !old
        })
        .then(|| {
            (
                DamperControl {
                    cells: &self.cells,
                    open_positions: [DEFAULT_OPEN_POSITION; NUM_DAMPERS],
                },
                DamperTicker { cells: &self.cells },
                EndstopSignal { cells: &self.cells },
            )
        })
    }
}

/// The endstop interrupt's handle: can only flag a transit
pub struct EndstopSignal<'a> {
    cells: &'a [DamperCell; NUM_DAMPERS],
}

impl<'a> EndstopSignal<'a> {
    /// Note that `damper` just passed its endstop
    #[inline]
    pub fn trigger(&self, damper: usize) {
        if let Some(cell) = self.cells.get(damper) {
            cell.endstop.store(true, Ordering::Release);
        }
    }
}

/// The timer interrupt's handle: estimates positions and drives the motors
pub struct DamperTicker<'a> {
    cells: &'a [DamperCell; NUM_DAMPERS],
}

impl<'a> DamperTicker<'a> {
    /// Run one control tick for every installed damper.
    ///
    /// Short, bounded and never blocks.
    pub fn tick<M: MotorDriver>(&mut self, motors: &mut M) {
        for (d, cell) in self.cells.iter().enumerate() {
            if !cell.installed.load(Ordering::Relaxed) {
                continue;
            }

            let mut current = cell.current.load(Ordering::Relaxed);
            if DamperCell::take_flag(&cell.endstop) {
                current = 0;
            }

            let target = cell.target.load(Ordering::Relaxed);
            if target == 0 && current == u8::MAX {
                cell.overflow.store(true, Ordering::Release);
            }

            if current != target {
                motors.set_motor(d, true);
                current = current.wrapping_add(1);
            } else {
                motors.set_motor(d, false);
            }
            cell.current.store(current, Ordering::Relaxed);
        }
    }
}

/// The main loop's handle: targets, calibration, installed set and faults
pub struct DamperControl<'a> {
    cells: &'a [DamperCell; NUM_DAMPERS],
    open_positions: [u8; NUM_DAMPERS],
}

impl<'a> DamperControl<'a> {
    /// Set which dampers are installed, one bit per damper
    pub fn set_installed_mask(&mut self, mask: u8) {
        self.cells.iter().enumerate().for_each(|(d, cell)| {
            cell.installed.store(mask & (1 << d) != 0, Ordering::Relaxed);
        });
    }

    /// Installed dampers, one bit per damper
    pub fn installed_mask(&self) -> u8 {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_d, cell)| cell.installed.load(Ordering::Relaxed))
            .fold(0, |mask, (d, _cell)| mask | (1 << d))
    }

    /// Is `damper` installed?
    pub fn is_installed(&self, damper: usize) -> bool {
        self.cells
            .get(damper)
            .map(|c| c.installed.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// The open position calibration, per damper
    pub fn open_positions(&self) -> [u8; NUM_DAMPERS] {
        self.open_positions
    }

    /// Replace the open position calibration. Values are clamped to
    /// [`MAX_OPEN_POSITION`].
    ///
    /// Returns `true` if anything changed.
    pub fn set_open_positions(&mut self, positions: [u8; NUM_DAMPERS]) -> bool {
        let clamped = positions.map(|p| p.min(MAX_OPEN_POSITION));
        let changed = clamped != self.open_positions;
        self.open_positions = clamped;
        changed
    }

    /// Set the target position of `damper`, in ticks
    pub fn set_target(&mut self, damper: usize, ticks: u8) {
        if let Some(cell) = self.cells.get(damper) {
            cell.target.store(ticks, Ordering::Relaxed);
        }
    }

    /// Set all damper targets from a damper command
    pub fn apply(&mut self, cmd: &DamperCmd) {
        for (d, pos) in cmd.dampers.iter().enumerate() {
            let ticks = pos.target_ticks(self.open_positions[d]);
            self.set_target(d, ticks);
        }
    }

    /// Target position of `damper`
    pub fn target(&self, damper: usize) -> u8 {
        self.cells
            .get(damper)
            .map(|c| c.target.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Estimated position of `damper`
    pub fn current(&self, damper: usize) -> u8 {
        self.cells
            .get(damper)
            .map(|c| c.current.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Is an endstop transit waiting for the next tick? Does not clear it.
    pub fn endstop_pending(&self, damper: usize) -> bool {
        self.cells
            .get(damper)
            .map(|c| c.endstop.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Has `damper` reached its target? Dampers that are not installed
    /// always have.
    pub fn reached_target(&self, damper: usize) -> bool {
        !self.is_installed(damper) || self.current(damper) == self.target(damper)
    }

    /// Have all installed dampers reached their targets?
    pub fn all_reached_target(&self) -> bool {
        (0..NUM_DAMPERS).all(|d| self.reached_target(d))
    }

    /// Are all installed dampers fully closed? Dampers that are not
    /// installed count as closed.
    pub fn all_closed(&self) -> bool {
        (0..NUM_DAMPERS).all(|d| !self.is_installed(d) || self.current(d) == 0)
    }

    /// Read and clear the overflow fault of `damper`
    pub fn take_overflow(&mut self, damper: usize) -> bool {
        self.cells
            .get(damper)
            .map(|c| DamperCell::take_flag(&c.overflow))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fan::FanState, message::DamperPosition};

    #[derive(Default)]
    struct Motors {
        running: [bool; NUM_DAMPERS],
    }

    impl MotorDriver for Motors {
        fn set_motor(&mut self, damper: usize, run: bool) {
            self.running[damper] = run;
        }
    }

    fn ticks(ticker: &mut DamperTicker<'_>, motors: &mut Motors, n: usize) {
        (0..n).for_each(|_| ticker.tick(motors));
    }

    #[test]
    fn take_only_once() {
        let storage = DamperStorage::new();
        assert!(storage.take().is_some());
        assert!(storage.take().is_none());
    }

    #[test]
    fn runs_until_target() {
        let storage = DamperStorage::new();
        let (mut ctl, mut ticker, _endstop) = storage.take().unwrap();
        let mut motors = Motors::default();
        ctl.set_installed_mask(0b001);
        ctl.set_target(0, 5);

        ticks(&mut ticker, &mut motors, 4);
        assert_eq!(ctl.current(0), 4);
        assert!(motors.running[0]);
        assert!(!ctl.reached_target(0));

        ticks(&mut ticker, &mut motors, 1);
        assert_eq!(ctl.current(0), 5);
        ticks(&mut ticker, &mut motors, 1);
        assert_eq!(ctl.current(0), 5);
        assert!(!motors.running[0]);
        assert!(ctl.reached_target(0));
    }

    #[test]
    fn uninstalled_dampers_are_left_alone() {
        let storage = DamperStorage::new();
        let (mut ctl, mut ticker, _endstop) = storage.take().unwrap();
        let mut motors = Motors::default();
        ctl.set_installed_mask(0b010);
        ctl.set_target(0, 5);
        ctl.set_target(1, 5);

        ticks(&mut ticker, &mut motors, 3);
        assert_eq!(ctl.current(0), 0);
        assert_eq!(ctl.current(1), 3);
        assert!(ctl.reached_target(0));
        assert!(!ctl.all_reached_target());
        assert_eq!(ctl.installed_mask(), 0b010);
    }

    #[test]
    fn endstop_resets_position_once() {
        let storage = DamperStorage::new();
        let (mut ctl, mut ticker, endstop) = storage.take().unwrap();
        let mut motors = Motors::default();
        ctl.set_installed_mask(0b100);
        ctl.set_target(2, 40);
        ticks(&mut ticker, &mut motors, 40);

        ctl.set_target(2, 0);
        ticks(&mut ticker, &mut motors, 3);
        assert_eq!(ctl.current(2), 43);

        endstop.trigger(2);
        assert!(ctl.endstop_pending(2));
        ticks(&mut ticker, &mut motors, 1);
        assert_eq!(ctl.current(2), 0);
        assert!(!ctl.endstop_pending(2));
        assert!(!motors.running[2]);

        // Consumed: the next tick does not reset anything
        ctl.set_target(2, 2);
        ticks(&mut ticker, &mut motors, 1);
        assert_eq!(ctl.current(2), 1);
        assert!(!ctl.endstop_pending(2));
    }

    #[test]
    fn missing_endstop_raises_overflow_exactly_once() {
        let storage = DamperStorage::new();
        let (mut ctl, mut ticker, _endstop) = storage.take().unwrap();
        let mut motors = Motors::default();
        ctl.set_installed_mask(0b001);
        ctl.set_target(0, 10);
        ticks(&mut ticker, &mut motors, 10);
        assert_eq!(ctl.current(0), 10);

        ctl.set_target(0, 0);
        let wrap = 256 - 10;
        ticks(&mut ticker, &mut motors, wrap - 1);
        assert_eq!(ctl.current(0), u8::MAX);
        assert!(!ctl.take_overflow(0));

        ticks(&mut ticker, &mut motors, 1);
        assert_eq!(ctl.current(0), 0);
        assert!(ctl.take_overflow(0));
        assert!(!ctl.take_overflow(0));

        // Stopped at (wrapped) zero, no further faults
        ticks(&mut ticker, &mut motors, 300);
        assert!(!motors.running[0]);
        assert!(!ctl.take_overflow(0));
    }

    #[test]
    fn open_targets_follow_calibration() {
        let storage = DamperStorage::new();
        let (mut ctl, _ticker, _endstop) = storage.take().unwrap();
        assert!(ctl.set_open_positions([80, 60, 200]));
        assert_eq!(ctl.open_positions(), [80, 60, MAX_OPEN_POSITION]);
        assert!(!ctl.set_open_positions([80, 60, 127]));

        ctl.apply(&DamperCmd {
            dampers: [
                DamperPosition::Open,
                DamperPosition::HalfOpen,
                DamperPosition::Closed,
            ],
            fan: FanState::Off,
            laminar: FanState::Off,
        });
        assert_eq!([ctl.target(0), ctl.target(1), ctl.target(2)], [80, 30, 0]);
    }

    #[test]
    fn closed_means_at_zero() {
        let storage = DamperStorage::new();
        let (mut ctl, mut ticker, _endstop) = storage.take().unwrap();
        let mut motors = Motors::default();
        ctl.set_installed_mask(0b011);
        assert!(ctl.all_closed());
        ctl.set_target(1, 1);
        ticks(&mut ticker, &mut motors, 1);
        assert!(!ctl.all_closed());
    }
}
