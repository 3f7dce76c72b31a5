//! Raw HCI management (`mgmt`) protocol: controller info, settings, commands and events.
//!
//! Everything here is framed over `AF_BLUETOOTH`/`BTPROTO_HCI` on the `HCI_CHANNEL_CONTROL`
//! channel; see [the kernel's mgmt-api documentation][mgmt] for the wire-level reference.
//!
//! [mgmt]: https://github.com/bluez/bluez/blob/master/doc/mgmt-api.txt

mod adapter;
mod socket;

pub use adapter::{ControllerEvent, HciAdapter};

use crate::{define_flags, Address};

/// Default controller index addressed by this crate; only a single controller is supported.
pub const DEFAULT_CONTROLLER_INDEX: u16 = 0;

define_flags!(pub Settings, "Current or supported mgmt settings bitfield." => {
    powered ("powered"),
    connectable ("connectable"),
    fast_connectable ("fast-connectable"),
    discoverable ("discoverable"),
    bondable ("bondable"),
    link_level_security ("link-level-security"),
    ssp ("secure-simple-pairing"),
    bredr ("br/edr"),
    hs ("high-speed"),
    le ("low-energy"),
    advertising ("advertising"),
    secure_connections ("secure-connections"),
    debug_keys ("debug-keys"),
    privacy ("privacy"),
    configuration ("configuration"),
    static_address ("static-address"),
});

impl Settings {
    pub(crate) fn from_bits(bits: u32) -> Self {
        const FIELDS: &[(u32, fn(&mut Settings))] = &[
            (1 << 0, |s| s.powered = true),
            (1 << 1, |s| s.connectable = true),
            (1 << 2, |s| s.fast_connectable = true),
            (1 << 3, |s| s.discoverable = true),
            (1 << 4, |s| s.bondable = true),
            (1 << 5, |s| s.link_level_security = true),
            (1 << 6, |s| s.ssp = true),
            (1 << 7, |s| s.bredr = true),
            (1 << 8, |s| s.hs = true),
            (1 << 9, |s| s.le = true),
            (1 << 10, |s| s.advertising = true),
            (1 << 11, |s| s.secure_connections = true),
            (1 << 12, |s| s.debug_keys = true),
            (1 << 13, |s| s.privacy = true),
            (1 << 14, |s| s.configuration = true),
            (1 << 15, |s| s.static_address = true),
        ];
        let mut settings = Settings::default();
        for (mask, set) in FIELDS {
            if bits & mask != 0 {
                set(&mut settings);
            }
        }
        settings
    }
}

/// Controller information as reported by `ReadControllerInfo`.
#[derive(Clone, Debug)]
pub struct ControllerInfo {
    /// Controller's public address.
    pub address: Address,
    /// Bluetooth core specification version implemented by the controller.
    pub version: u8,
    /// Manufacturer company identifier.
    pub manufacturer: u16,
    /// Settings this controller is capable of.
    pub supported_settings: Settings,
    /// Settings currently in effect.
    pub current_settings: Settings,
    /// Class of device (3 bytes, BR/EDR-only field, usually left at the default).
    pub class_of_device: [u8; 3],
    /// Short (max 10 byte) local name.
    pub short_name: String,
    /// Long local name.
    pub long_name: String,
}

/// mgmt management command opcodes used by this crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub(crate) enum Opcode {
    ReadControllerInfo = 0x0004,
    SetPowered = 0x0005,
    SetConnectable = 0x0007,
    SetBondable = 0x0009,
    SetBrEdr = 0x002a,
    SetLe = 0x002f,
    SetAdvertising = 0x0029,
    SetLocalName = 0x000f,
    SetDiscoverable = 0x0006,
}

/// mgmt management event codes this crate routes on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub(crate) enum EventCode {
    CommandComplete = 0x0001,
    CommandStatus = 0x0002,
    ControllerError = 0x0003,
    NewSettings = 0x0006,
    DeviceConnected = 0x000b,
    DeviceDisconnected = 0x000c,
}

impl EventCode {
    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => Self::CommandComplete,
            0x0002 => Self::CommandStatus,
            0x0003 => Self::ControllerError,
            0x0006 => Self::NewSettings,
            0x000b => Self::DeviceConnected,
            0x000c => Self::DeviceDisconnected,
            _ => return None,
        })
    }
}

/// mgmt status codes returned in `CommandComplete`/`CommandStatus`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Status(pub u8);

impl Status {
    pub(crate) const SUCCESS: Status = Status(0x00);

    pub(crate) fn is_success(&self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self.0 {
            0x00 => "success",
            0x01 => "unknown command",
            0x02 => "not connected",
            0x03 => "failed",
            0x04 => "connect failed",
            0x05 => "authentication failed",
            0x0c => "busy",
            0x0d => "rejected",
            0x11 => "invalid parameters",
            _ => "unknown status",
        };
        write!(f, "{} (0x{:02x})", name, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_bits_decodes_powered_and_le() {
        let settings = Settings::from_bits(0b1_0000_0010_0001);
        assert!(settings.powered);
        assert!(settings.le);
        assert!(!settings.bredr);
    }

    #[test]
    fn settings_as_vec_round_trips_from_slice() {
        let mut settings = Settings::default();
        settings.powered = true;
        settings.le = true;
        let encoded = settings.as_vec();
        let decoded = Settings::from_slice(&encoded);
        assert_eq!(decoded, settings);
    }
}
