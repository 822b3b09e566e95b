//! Fan control
//!
//! Fans are only ever switched from the main loop. What a fan should be doing
//! is derived fresh every pass from its target state and the dampers; it is
//! never stored.
//!
//! * The main fan runs iff its target is on, every installed damper has
//!   reached its target, and not every damper is closed. No point blowing
//!   against closed or still moving dampers.
//! * The laminar flow fan runs iff its target is on, the main fan runs, and
//!   its own damper has reached its target.
//!
//! Fan targets are only switched on by a chaincast damper command that has
//! reached every node, see [`crate::chaincast`].

use crate::{damper::DamperControl, FanDriver};

/// Which fan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Fan {
    /// The main ventilation fan
    Main,
    /// The laminar flow fan
    Laminar,
}

/// Requested fan state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FanState {
    /// Off
    #[default]
    Off,
    /// On, once the dampers allow it
    On,
}

impl FanState {
    /// `On` for a set bit
    #[inline]
    pub const fn from_bit(bit: bool) -> Self {
        if bit {
            FanState::On
        } else {
            FanState::Off
        }
    }
}

/// Target states of both fans
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanControl {
    main: FanState,
    laminar: FanState,
}

impl FanControl {
    /// Both fans off
    pub const fn new() -> Self {
        Self {
            main: FanState::Off,
            laminar: FanState::Off,
        }
    }

    /// Replace both targets
    pub fn set_targets(&mut self, main: FanState, laminar: FanState) {
        self.main = main;
        self.laminar = laminar;
    }

    /// The target of `fan`
    pub fn target(&self, fan: Fan) -> FanState {
        match fan {
            Fan::Main => self.main,
            Fan::Laminar => self.laminar,
        }
    }

    /// Should the main fan be running right now?
    pub fn main_runs(&self, dampers: &DamperControl<'_>) -> bool {
        self.main == FanState::On && dampers.all_reached_target() && !dampers.all_closed()
    }

    /// Should the laminar fan be running right now?
    pub fn laminar_runs(&self, dampers: &DamperControl<'_>, laminar_damper: usize) -> bool {
        self.laminar == FanState::On
            && self.main_runs(dampers)
            && dampers.reached_target(laminar_damper)
    }

    /// Switch both fans to what they should be doing
    pub fn drive<F: FanDriver>(&self, dampers: &DamperControl<'_>, laminar_damper: usize, fans: &mut F) {
        fans.set_fan(Fan::Main, self.main_runs(dampers));
        fans.set_fan(Fan::Laminar, self.laminar_runs(dampers, laminar_damper));
    }
}
