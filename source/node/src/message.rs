//! Wire messages
//!
//! A message is one tag byte followed by a fixed-length, tag-specific
//! payload. The total length for each tag is given by
//! [`Tag::expected_length()`], and that is the ONLY thing used to decide
//! whether a received message is well formed.
//!
//! | Tag | Name             | Len | Layout                                       |
//! | --- | ---------------- | --- | -------------------------------------------- |
//! | 0   | `DamperCmd`      | 6   | tag, reach, damper0, damper1, damper2, fans  |
//! | 1   | `PressureInfo`   | 10  | tag, sensor, celsius (f32 LE), pascal (f32 LE)|
//! | 2   | `Error`          | 3   | tag, damper, error type                      |
//! | 3   | `UpdateSettings` | 5   | tag, reach, open0, open1, open2              |
//! | 4   | `IdDoAuto`       | 1   | tag                                          |
//! | 5   | `IdQuestion`     | 1   | tag                                          |
//! | 6   | `IdInfo`         | 2   | tag, id                                      |
//! | 7   | `IdSet`          | 2   | tag, id                                      |
//!
//! `DamperCmd` and `UpdateSettings` are chaincast messages, and carry the
//! `reach` bitfield directly after the tag.

use core::ops::Deref;

use crate::{fan::FanState, MAX_MESSAGE_LEN, NUM_DAMPERS};

/// Message type tag, the first byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Tag {
    /// Chaincast damper/fan command
    DamperCmd,
    /// Pressure sensor telemetry
    PressureInfo,
    /// Error telemetry
    Error,
    /// Chaincast calibration update
    UpdateSettings,
    /// "Everyone re-acquire an address"
    IdDoAuto,
    /// "Everyone tell me your address"
    IdQuestion,
    /// Reply to [`Tag::IdQuestion`]
    IdInfo,
    /// "Take this address"
    IdSet,
}

impl Tag {
    const DAMPER_CMD: u8 = 0;
    const PRESSURE_INFO: u8 = 1;
    const ERROR: u8 = 2;
    const UPDATE_SETTINGS: u8 = 3;
    const ID_DO_AUTO: u8 = 4;
    const ID_QUESTION: u8 = 5;
    const ID_INFO: u8 = 6;
    const ID_SET: u8 = 7;

    /// Total message length in bytes for this tag, tag byte included
    pub const fn expected_length(self) -> u8 {
        match self {
            Tag::DamperCmd => 2 + NUM_DAMPERS as u8 + 1,
            Tag::PressureInfo => 1 + 1 + 4 + 4,
            Tag::Error => 3,
            Tag::UpdateSettings => 2 + NUM_DAMPERS as u8,
            Tag::IdDoAuto | Tag::IdQuestion => 1,
            Tag::IdInfo | Tag::IdSet => 2,
        }
    }

    /// Is this a chaincast message, carrying a reach field?
    pub const fn is_chaincast(self) -> bool {
        matches!(self, Tag::DamperCmd | Tag::UpdateSettings)
    }
}

impl TryFrom<u8> for Tag {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            Self::DAMPER_CMD => Ok(Tag::DamperCmd),
            Self::PRESSURE_INFO => Ok(Tag::PressureInfo),
            Self::ERROR => Ok(Tag::Error),
            Self::UPDATE_SETTINGS => Ok(Tag::UpdateSettings),
            Self::ID_DO_AUTO => Ok(Tag::IdDoAuto),
            Self::ID_QUESTION => Ok(Tag::IdQuestion),
            Self::ID_INFO => Ok(Tag::IdInfo),
            Self::ID_SET => Ok(Tag::IdSet),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

impl From<Tag> for u8 {
    fn from(val: Tag) -> Self {
        match val {
            Tag::DamperCmd => Tag::DAMPER_CMD,
            Tag::PressureInfo => Tag::PRESSURE_INFO,
            Tag::Error => Tag::ERROR,
            Tag::UpdateSettings => Tag::UPDATE_SETTINGS,
            Tag::IdDoAuto => Tag::ID_DO_AUTO,
            Tag::IdQuestion => Tag::ID_QUESTION,
            Tag::IdInfo => Tag::ID_INFO,
            Tag::IdSet => Tag::ID_SET,
        }
    }
}

/// Expected total length for a raw tag byte, or `None` for unknown tags
pub fn expected_length(tag: u8) -> Option<u8> {
    Tag::try_from(tag).ok().map(Tag::expected_length)
}

/// Reasons a byte slice is not a valid message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum DecodeError {
    /// Zero bytes, not even a tag
    Empty,
    /// The tag byte is not one we know
    UnknownTag(u8),
    /// The length does not match the tag
    BadLength {
        /// The raw tag byte
        tag: u8,
        /// The length this tag requires
        expected: u8,
        /// The length we got
        got: usize,
    },
}

/// Requested position for one damper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DamperPosition {
    /// Drive to the endstop
    Closed,
    /// Drive to the calibrated open position
    Open,
    /// Drive to half the calibrated open position
    HalfOpen,
}

impl DamperPosition {
    /// Unknown values are treated as [`DamperPosition::Closed`].
    pub const fn from_u8(val: u8) -> Self {
        match val {
            1 => DamperPosition::Open,
            2 => DamperPosition::HalfOpen,
            _ => DamperPosition::Closed,
        }
    }

    /// The wire byte
    pub const fn as_u8(self) -> u8 {
        match self {
            DamperPosition::Closed => 0,
            DamperPosition::Open => 1,
            DamperPosition::HalfOpen => 2,
        }
    }

    /// Target tick count for a damper with the given open calibration
    pub const fn target_ticks(self, open_position: u8) -> u8 {
        match self {
            DamperPosition::Closed => 0,
            DamperPosition::Open => open_position,
            DamperPosition::HalfOpen => open_position / 2,
        }
    }
}

/// Body of a [`Tag::DamperCmd`] message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DamperCmd {
    /// One requested position per damper
    pub dampers: [DamperPosition; NUM_DAMPERS],
    /// Main fan request
    pub fan: FanState,
    /// Laminar flow fan request
    pub laminar: FanState,
}

impl DamperCmd {
    const FAN_BIT: u8 = 0b01;
    const LAMINAR_BIT: u8 = 0b10;

    fn fan_bits(&self) -> u8 {
        let mut bits = 0;
        if self.fan == FanState::On {
            bits |= Self::FAN_BIT;
        }
        if self.laminar == FanState::On {
            bits |= Self::LAMINAR_BIT;
        }
        bits
    }
}

/// Body of a [`Tag::UpdateSettings`] message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdateSettings {
    /// Open position calibration, in ticks, per damper
    pub open_positions: [u8; NUM_DAMPERS],
}

/// A chaincast envelope: the reach bitfield plus a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chaincast<T> {
    /// One bit per participant that has seen this message
    pub reach: u8,
    /// The command itself
    pub body: T,
}

/// Body of a [`Tag::PressureInfo`] message
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PressureInfo {
    /// Which sensor this is from
    pub sensor_id: u8,
    /// Temperature in degrees Celsius
    pub celsius: f32,
    /// Pressure in Pascal
    pub pascal: f32,
}

/// What went wrong, in an [`ErrorInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// No error
    None,
    /// A damper ran for a full position wrap without seeing its endstop
    Timeout,
    /// Some error type we do not know, kept as-is
    Other(u8),
}

impl From<u8> for ErrorKind {
    fn from(value: u8) -> Self {
        match value {
            0 => ErrorKind::None,
            1 => ErrorKind::Timeout,
            other => ErrorKind::Other(other),
        }
    }
}

impl From<ErrorKind> for u8 {
    fn from(val: ErrorKind) -> Self {
        match val {
            ErrorKind::None => 0,
            ErrorKind::Timeout => 1,
            ErrorKind::Other(other) => other,
        }
    }
}

/// Body of a [`Tag::Error`] message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorInfo {
    /// Index of the damper the error is about
    pub damper_id: u8,
    /// What went wrong
    pub kind: ErrorKind,
}

/// A decoded message
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    /// Damper targets and fan requests, chaincast
    DamperCmd(Chaincast<DamperCmd>),
    /// Pressure telemetry
    PressureInfo(PressureInfo),
    /// Error telemetry
    Error(ErrorInfo),
    /// Calibration update, chaincast
    UpdateSettings(Chaincast<UpdateSettings>),
    /// Re-acquire an address
    IdDoAuto,
    /// Report your address to the asker
    IdQuestion,
    /// "My address is `id`"
    IdInfo {
        /// The sender's address
        id: u8,
    },
    /// "Your address is now `id`"
    IdSet {
        /// The new address
        id: u8,
    },
}

impl Message {
    /// The tag of this message
    pub const fn tag(&self) -> Tag {
        match self {
            Message::DamperCmd(_) => Tag::DamperCmd,
            Message::PressureInfo(_) => Tag::PressureInfo,
            Message::Error(_) => Tag::Error,
            Message::UpdateSettings(_) => Tag::UpdateSettings,
            Message::IdDoAuto => Tag::IdDoAuto,
            Message::IdQuestion => Tag::IdQuestion,
            Message::IdInfo { .. } => Tag::IdInfo,
            Message::IdSet { .. } => Tag::IdSet,
        }
    }

    /// Decode a message, checking the length against the tag
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&raw_tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let tag = Tag::try_from(raw_tag)?;
        let expected = tag.expected_length();
        if bytes.len() != expected as usize {
            return Err(DecodeError::BadLength {
                tag: raw_tag,
                expected,
                got: bytes.len(),
            });
        }

        let msg = match tag {
            Tag::DamperCmd => {
                let mut dampers = [DamperPosition::Closed; NUM_DAMPERS];
                dampers
                    .iter_mut()
                    .zip(body[1..].iter())
                    .for_each(|(d, b)| *d = DamperPosition::from_u8(*b));
                let fans = body[1 + NUM_DAMPERS];
                Message::DamperCmd(Chaincast {
                    reach: body[0],
                    body: DamperCmd {
                        dampers,
                        fan: FanState::from_bit(fans & DamperCmd::FAN_BIT != 0),
                        laminar: FanState::from_bit(fans & DamperCmd::LAMINAR_BIT != 0),
                    },
                })
            }
            Tag::PressureInfo => Message::PressureInfo(PressureInfo {
                sensor_id: body[0],
                celsius: f32::from_le_bytes([body[1], body[2], body[3], body[4]]),
                pascal: f32::from_le_bytes([body[5], body[6], body[7], body[8]]),
            }),
            Tag::Error => Message::Error(ErrorInfo {
                damper_id: body[0],
                kind: ErrorKind::from(body[1]),
            }),
            Tag::UpdateSettings => {
                let mut open_positions = [0u8; NUM_DAMPERS];
                open_positions.copy_from_slice(&body[1..1 + NUM_DAMPERS]);
                Message::UpdateSettings(Chaincast {
                    reach: body[0],
                    body: UpdateSettings { open_positions },
                })
            }
            Tag::IdDoAuto => Message::IdDoAuto,
            Tag::IdQuestion => Message::IdQuestion,
            Tag::IdInfo => Message::IdInfo { id: body[0] },
            Tag::IdSet => Message::IdSet { id: body[0] },
        };
        Ok(msg)
    }

    /// Encode this message into a wire frame
    pub fn encode(&self) -> Frame {
        let mut frame = Frame::new(self.tag());
        match self {
            Message::DamperCmd(cc) => {
                frame.push(cc.reach);
                cc.body.dampers.iter().for_each(|d| frame.push(d.as_u8()));
                frame.push(cc.body.fan_bits());
            }
            Message::PressureInfo(pi) => {
                frame.push(pi.sensor_id);
                frame.extend(&pi.celsius.to_le_bytes());
                frame.extend(&pi.pascal.to_le_bytes());
            }
            Message::Error(ei) => {
                frame.push(ei.damper_id);
                frame.push(ei.kind.into());
            }
            Message::UpdateSettings(cc) => {
                frame.push(cc.reach);
                frame.extend(&cc.body.open_positions);
            }
            Message::IdDoAuto | Message::IdQuestion => {}
            Message::IdInfo { id } | Message::IdSet { id } => frame.push(*id),
        }
        frame
    }
}

/// An encoded message, ready to send
///
/// Storage is always [`MAX_MESSAGE_LEN`] bytes; the frame derefs to the
/// used part only.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    buf: [u8; MAX_MESSAGE_LEN],
    len: u8,
}

impl Frame {
    fn new(tag: Tag) -> Self {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        buf[0] = tag.into();
        Self { buf, len: 1 }
    }

    // Only called while encoding a known tag, so never beyond the tag's length
    fn push(&mut self, byte: u8) {
        self.buf[self.len as usize] = byte;
        self.len += 1;
    }

    fn extend(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|b| self.push(*b));
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf[..self.len as usize]
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_message() -> [Message; 8] {
        [
            Message::DamperCmd(Chaincast {
                reach: 0b010,
                body: DamperCmd {
                    dampers: [
                        DamperPosition::Open,
                        DamperPosition::HalfOpen,
                        DamperPosition::Closed,
                    ],
                    fan: FanState::On,
                    laminar: FanState::Off,
                },
            }),
            Message::PressureInfo(PressureInfo {
                sensor_id: 2,
                celsius: 21.5,
                pascal: 101_325.0,
            }),
            Message::Error(ErrorInfo {
                damper_id: 1,
                kind: ErrorKind::Timeout,
            }),
            Message::UpdateSettings(Chaincast {
                reach: 0b101,
                body: UpdateSettings {
                    open_positions: [100, 90, 127],
                },
            }),
            Message::IdDoAuto,
            Message::IdQuestion,
            Message::IdInfo { id: 7 },
            Message::IdSet { id: 2 },
        ]
    }

    #[test]
    fn every_tag_roundtrips_at_its_length() {
        for msg in every_message() {
            let frame = msg.encode();
            assert_eq!(frame.len(), msg.tag().expected_length() as usize);
            assert_eq!(Message::decode(&frame), Ok(msg));
        }
    }

    #[test]
    fn wrong_lengths_are_rejected() {
        for msg in every_message() {
            let frame = msg.encode();
            let expected = msg.tag().expected_length();

            let mut buf = [0u8; MAX_MESSAGE_LEN];
            buf[..frame.len()].copy_from_slice(&frame);
            for len in 1..=MAX_MESSAGE_LEN {
                let got = Message::decode(&buf[..len]);
                if len == expected as usize {
                    assert_eq!(got, Ok(msg));
                } else {
                    assert_eq!(
                        got,
                        Err(DecodeError::BadLength {
                            tag: frame[0],
                            expected,
                            got: len,
                        }),
                        "{:?} with {} bytes",
                        msg.tag(),
                        len
                    );
                }
            }
            assert_eq!(Message::decode(&buf[..0]), Err(DecodeError::Empty));
        }
    }

    #[test]
    fn empty_and_unknown() {
        assert_eq!(Message::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Message::decode(&[8]), Err(DecodeError::UnknownTag(8)));
        assert_eq!(Message::decode(&[0xFF, 1, 2]), Err(DecodeError::UnknownTag(0xFF)));
        assert_eq!(expected_length(8), None);
        assert_eq!(expected_length(0), Some(6));
        assert_eq!(expected_length(1), Some(10));
    }

    #[test]
    fn damper_cmd_layout() {
        // reach 0, open / closed / half, main fan + laminar
        let raw = [0, 0, 1, 0, 2, 0b11];
        let Ok(Message::DamperCmd(cc)) = Message::decode(&raw) else {
            panic!("not a damper cmd");
        };
        assert_eq!(cc.reach, 0);
        assert_eq!(
            cc.body.dampers,
            [DamperPosition::Open, DamperPosition::Closed, DamperPosition::HalfOpen]
        );
        assert_eq!(cc.body.fan, FanState::On);
        assert_eq!(cc.body.laminar, FanState::On);
    }

    #[test]
    fn unknown_damper_command_means_closed() {
        let raw = [0, 0, 9, 1, 200, 0];
        let Ok(Message::DamperCmd(cc)) = Message::decode(&raw) else {
            panic!("not a damper cmd");
        };
        assert_eq!(
            cc.body.dampers,
            [DamperPosition::Closed, DamperPosition::Open, DamperPosition::Closed]
        );
    }

    #[test]
    fn half_open_is_half_the_calibration() {
        assert_eq!(DamperPosition::HalfOpen.target_ticks(101), 50);
        assert_eq!(DamperPosition::Open.target_ticks(101), 101);
        assert_eq!(DamperPosition::Closed.target_ticks(101), 0);
    }

    #[test]
    fn unknown_error_kinds_survive() {
        let raw = [2, 0, 42];
        assert_eq!(
            Message::decode(&raw),
            Ok(Message::Error(ErrorInfo {
                damper_id: 0,
                kind: ErrorKind::Other(42),
            }))
        );
        assert_eq!(&*Message::decode(&raw).unwrap().encode(), &raw);
    }
}
