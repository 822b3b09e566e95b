//! Serial console command decoder
//!
//! The operator console is a byte stream of single-character commands, some
//! followed by arguments:
//!
//! | Bytes                      | Command                                   |
//! | -------------------------- | ----------------------------------------- |
//! | `P` digit                  | set device id                             |
//! | `I` digit                  | set installed damper bitmask              |
//! | `o` / `c` / `h`            | open / close / half-open every damper     |
//! | `M`                        | become master of ids, renumber the fleet  |
//! | `A`                        | broadcast "everyone re-acquire an id"     |
//! | `>` dest len payload...    | inject a raw message (binary arguments)   |
//! | `s`                        | dump state                                |
//! | `!`                        | reset to bootloader                       |
//!
//! Unknown command bytes are ignored. This module only decodes; see
//! [`Node::apply_console()`][crate::Node::apply_console] for the effects.

use heapless::Vec;

use crate::{message::DamperPosition, MAX_MESSAGE_LEN};

/// A decoded console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Take this device id and persist it
    SetDeviceId(u8),
    /// Take this installed damper bitmask and persist it
    SetInstalledMask(u8),
    /// Chaincast a damper command moving every damper to this position
    Dampers(DamperPosition),
    /// Run a renumbering round as master
    BecomeMaster,
    /// Broadcast `IdDoAuto`
    BroadcastAutoId,
    /// Send (and maybe self-deliver) a raw message
    Inject {
        /// Destination address
        dest: u8,
        /// Raw message bytes, tag included
        payload: Vec<u8, MAX_MESSAGE_LEN>,
    },
    /// Print the diagnostic state
    DumpState,
    /// Reset into the bootloader. Handled by the application.
    ResetToBootloader,
}

enum State {
    Command,
    DeviceId,
    InstalledMask,
    InjectDest,
    InjectLen { dest: u8 },
    InjectPayload { dest: u8, remaining: u8, overflow: bool },
}

/// Byte-at-a-time console decoder
pub struct Console {
    state: State,
    payload: Vec<u8, MAX_MESSAGE_LEN>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    /// Create a decoder waiting for a command byte
    pub const fn new() -> Self {
        Self {
            state: State::Command,
            payload: Vec::new(),
        }
    }

    /// Process a single console byte. Returns `Some(ConsoleCommand)` once a
    /// command is complete.
    pub fn push(&mut self, byte: u8) -> Option<ConsoleCommand> {
        match self.state {
            State::Command => {
                match byte {
                    b'P' => self.state = State::DeviceId,
                    b'I' => self.state = State::InstalledMask,
                    b'>' => self.state = State::InjectDest,
                    b'o' => return Some(ConsoleCommand::Dampers(DamperPosition::Open)),
                    b'c' => return Some(ConsoleCommand::Dampers(DamperPosition::Closed)),
                    b'h' => return Some(ConsoleCommand::Dampers(DamperPosition::HalfOpen)),
                    b'M' => return Some(ConsoleCommand::BecomeMaster),
                    b'A' => return Some(ConsoleCommand::BroadcastAutoId),
                    b's' => return Some(ConsoleCommand::DumpState),
                    b'!' => return Some(ConsoleCommand::ResetToBootloader),
                    _ => {}
                }
                None
            }
            State::DeviceId => {
                self.state = State::Command;
                Some(ConsoleCommand::SetDeviceId(byte.wrapping_sub(b'0')))
            }
            State::InstalledMask => {
                self.state = State::Command;
                Some(ConsoleCommand::SetInstalledMask(byte.wrapping_sub(b'0')))
            }
            State::InjectDest => {
                self.state = State::InjectLen { dest: byte };
                None
            }
            State::InjectLen { dest } => {
                if byte == 0 {
                    self.state = State::Command;
                } else {
                    self.payload.clear();
                    self.state = State::InjectPayload {
                        dest,
                        remaining: byte,
                        overflow: false,
                    };
                }
                None
            }
            State::InjectPayload {
                dest,
                remaining,
                overflow,
            } => {
                let overflow = overflow || self.payload.push(byte).is_err();
                let remaining = remaining - 1;
                if remaining != 0 {
                    self.state = State::InjectPayload {
                        dest,
                        remaining,
                        overflow,
                    };
                    return None;
                }

                self.state = State::Command;
                if overflow {
                    node_warn!("console message too long for the bus, dropped");
                    return None;
                }
                Some(ConsoleCommand::Inject {
                    dest,
                    payload: core::mem::take(&mut self.payload),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(console: &mut Console, bytes: &[u8]) -> Option<ConsoleCommand> {
        let mut out = None;
        for b in bytes {
            if let Some(cmd) = console.push(*b) {
                assert!(out.is_none(), "more than one command");
                out = Some(cmd);
            }
        }
        out
    }

    #[test]
    fn single_byte_commands() {
        let mut c = Console::new();
        assert_eq!(feed(&mut c, b"M"), Some(ConsoleCommand::BecomeMaster));
        assert_eq!(feed(&mut c, b"A"), Some(ConsoleCommand::BroadcastAutoId));
        assert_eq!(feed(&mut c, b"s"), Some(ConsoleCommand::DumpState));
        assert_eq!(feed(&mut c, b"!"), Some(ConsoleCommand::ResetToBootloader));
        assert_eq!(
            feed(&mut c, b"h"),
            Some(ConsoleCommand::Dampers(DamperPosition::HalfOpen))
        );
        assert_eq!(feed(&mut c, b"xyz"), None);
    }

    #[test]
    fn digit_arguments() {
        let mut c = Console::new();
        assert_eq!(feed(&mut c, b"P4"), Some(ConsoleCommand::SetDeviceId(4)));
        assert_eq!(feed(&mut c, b"I5"), Some(ConsoleCommand::SetInstalledMask(0b101)));
    }

    #[test]
    fn inject() {
        let mut c = Console::new();
        let cmd = feed(&mut c, &[b'>', 1, 6, 0, 0, 1, 1, 1, 0b11]);
        let Some(ConsoleCommand::Inject { dest, payload }) = cmd else {
            panic!("expected inject, got {cmd:?}");
        };
        assert_eq!(dest, 1);
        assert_eq!(payload.as_slice(), &[0, 0, 1, 1, 1, 0b11]);

        // Back to commands afterwards
        assert_eq!(feed(&mut c, b"s"), Some(ConsoleCommand::DumpState));
    }

    #[test]
    fn zero_length_inject_is_cancelled() {
        let mut c = Console::new();
        assert_eq!(feed(&mut c, &[b'>', 3, 0]), None);
        assert_eq!(feed(&mut c, b"M"), Some(ConsoleCommand::BecomeMaster));
    }

    #[test]
    fn oversized_inject_is_dropped() {
        let mut c = Console::new();
        let mut bytes = [0u8; 3 + MAX_MESSAGE_LEN + 1];
        bytes[0] = b'>';
        bytes[1] = 2;
        bytes[2] = MAX_MESSAGE_LEN as u8 + 1;
        assert_eq!(feed(&mut c, &bytes), None);
        assert_eq!(feed(&mut c, b"A"), Some(ConsoleCommand::BroadcastAutoId));
    }
}
