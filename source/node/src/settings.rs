//! Persisted settings
//!
//! The settings record is a handful of bytes in some non-volatile store
//! (EEPROM, a flash page, ...):
//!
//! | Offset | Content                                      |
//! | ------ | -------------------------------------------- |
//! | 0      | format version, currently `0`                |
//! | 1      | device id (`255` for unassigned)             |
//! | 2      | number of dampers the record was written for |
//! | 3..6   | open position calibration, one per damper    |
//! | 6      | installed damper bitmask                     |
//!
//! A record with a different version is ignored entirely. A record written
//! for a different number of dampers only contributes its device id.

use crate::{damper::DEFAULT_OPEN_POSITION, raw_id, DeviceId, NUM_DAMPERS};

/// Current record format version
pub const SETTINGS_VERSION: u8 = 0;

/// Size of the settings record in bytes
pub const RECORD_LEN: usize = 3 + NUM_DAMPERS + 1;

/// Load/save access to the raw settings record
pub trait SettingsStore {
    /// The error type of the underlying storage
    type StoreError;

    /// Read the record into `buf`
    fn load(&mut self, buf: &mut [u8; RECORD_LEN]) -> Result<(), Self::StoreError>;

    /// Write the record
    fn save(&mut self, record: &[u8; RECORD_LEN]) -> Result<(), Self::StoreError>;
}

/// Why a stored record could not be used as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SettingsError {
    /// The record has a format version we don't know
    VersionMismatch(u8),
    /// The record was written for a different number of dampers. Only the
    /// device id can be trusted.
    DamperCountMismatch {
        /// The damper count in the record
        count: u8,
        /// The device id in the record
        device_id: Option<DeviceId>,
    },
}

/// Everything a node persists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Our address, `None` if unassigned
    pub device_id: Option<DeviceId>,
    /// Open position calibration, in ticks
    pub open_positions: [u8; NUM_DAMPERS],
    /// Installed dampers, one bit per damper
    pub installed_mask: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_id: None,
            open_positions: [DEFAULT_OPEN_POSITION; NUM_DAMPERS],
            installed_mask: (1 << NUM_DAMPERS) - 1,
        }
    }
}

impl Settings {
    /// Serialize into a settings record
    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0] = SETTINGS_VERSION;
        out[1] = raw_id(self.device_id);
        out[2] = NUM_DAMPERS as u8;
        out[3..3 + NUM_DAMPERS].copy_from_slice(&self.open_positions);
        out[3 + NUM_DAMPERS] = self.installed_mask;
        out
    }

    /// Parse a settings record
    pub fn from_bytes(raw: &[u8; RECORD_LEN]) -> Result<Self, SettingsError> {
        if raw[0] != SETTINGS_VERSION {
            return Err(SettingsError::VersionMismatch(raw[0]));
        }
        let device_id = DeviceId::new(raw[1]);
        if raw[2] != NUM_DAMPERS as u8 {
            return Err(SettingsError::DamperCountMismatch {
                count: raw[2],
                device_id,
            });
        }
        let mut open_positions = [0u8; NUM_DAMPERS];
        open_positions.copy_from_slice(&raw[3..3 + NUM_DAMPERS]);
        Ok(Settings {
            device_id,
            open_positions,
            installed_mask: raw[3 + NUM_DAMPERS] & ((1 << NUM_DAMPERS) - 1),
        })
    }

    /// Parse a settings record, keeping whatever can be kept and falling
    /// back to defaults for the rest
    pub fn recover(raw: &[u8; RECORD_LEN]) -> Self {
        match Self::from_bytes(raw) {
            Ok(s) => s,
            Err(SettingsError::VersionMismatch(v)) => {
                node_warn!("settings version {=u8} unknown, using defaults", v);
                Settings::default()
            }
            Err(SettingsError::DamperCountMismatch { count, device_id }) => {
                node_warn!("settings are for {=u8} dampers, keeping only the id", count);
                Settings {
                    device_id,
                    ..Settings::default()
                }
            }
        }
    }
}
