//! Request/response model for the chassis-manager command protocol.

pub mod codec;
pub mod ipmitool;
pub mod transport;

pub use transport::{Completion, CompletionEvent, RetryBudget, Tag, Transport};

use std::fmt;

pub const NETFN_APP: u8 = 0x06;
pub const NETFN_TRANSPORT: u8 = 0x0C;
pub const NETFN_CM: u8 = 0x38;

pub const CMD_GET_DEVICE_ID: u8 = 0x01;
pub const CMD_WARM_RESET: u8 = 0x03;

pub const CMD_GET_LAN_CONFIG: u8 = 0x02;

pub const CMD_DRAWER_PRESENCE: u8 = 0x01;
pub const CMD_FAN_PRESENCE: u8 = 0x02;
pub const CMD_PZONE_PRESENCE: u8 = 0x03;
pub const CMD_PSU_PRESENCE: u8 = 0x04;
pub const CMD_DRAWER_ALERT: u8 = 0x05;
pub const CMD_FAN_SPEED: u8 = 0x06;
pub const CMD_SET_ZONE_PWM: u8 = 0x07;
pub const CMD_PSU_POWER_IN: u8 = 0x08;
pub const CMD_PSU_CURRENT_OUT: u8 = 0x09;
pub const CMD_PSU_PMBUS: u8 = 0x0A;
pub const CMD_PERIPHERAL_RESET: u8 = 0x0B;
pub const CMD_DRAWER_TEMP: u8 = 0x0C;
pub const CMD_AGGREGATED_THERMAL: u8 = 0x0D;
pub const CMD_AGGREGATED_HEALTH: u8 = 0x0E;
pub const CMD_TRAY_POWER: u8 = 0x0F;
pub const CMD_SET_ID_FIELD: u8 = 0x10;
pub const CMD_GET_ID_FIELD: u8 = 0x11;
pub const CMD_UART_SWITCH: u8 = 0x12;

/// LAN configuration parameter selectors
pub const LAN_CHANNEL: u8 = 0x01;
pub const LAN_PARAM_IP_ADDRESS: u8 = 0x03;
pub const LAN_PARAM_IP_SOURCE: u8 = 0x04;
pub const LAN_PARAM_SUBNET_MASK: u8 = 0x06;

const ID_FIELD_TYPE_DEFAULT: u8 = 0x00;
const ID_FIELD_LEN: u8 = 4;

/// PMBus passthrough operations (second byte of a `CMD_PSU_PMBUS` request)
pub const PMBUS_READ_WORD: u8 = 0x01;
pub const PMBUS_READ_BLOCK: u8 = 0x02;
pub const PMBUS_WRITE_BYTE: u8 = 0x03;

pub const PMBUS_OPERATION: u8 = 0x01;
pub const PMBUS_STATUS_WORD: u8 = 0x79;
pub const PMBUS_READ_POUT: u8 = 0x96;
pub const PMBUS_MFR_ID: u8 = 0x99;
pub const PMBUS_MFR_MODEL: u8 = 0x9A;
pub const PMBUS_MFR_REVISION: u8 = 0x9B;
pub const PMBUS_MFR_SERIAL: u8 = 0x9E;
pub const PMBUS_MFR_POUT_MAX: u8 = 0xA7;

/// Drawer controller address behind the tray bridge.
pub const DRAWER_CONTROLLER_ADDR: u8 = 0x24;
pub const TRAY_BRIDGE_ADDR: u8 = 0x10;
pub const TRAY_BRIDGE_CHANNEL: u8 = 0x02;

/// Identity fields a drawer controller stores on behalf of the rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdField {
    RackPuid = 0x01,
    RackBpid = 0x02,
    DrawerRuid = 0x03,
}

impl IdField {
    pub fn instance(self) -> u8 {
        self as u8
    }
}

/// IPMI completion code. Only `OK` means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    pub const OK: CompletionCode = CompletionCode(0x00);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Envelope for reaching a controller nested behind the chassis manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bridge {
    Single {
        addr: u8,
        channel: u8,
    },
    Dual {
        transit_addr: u8,
        transit_channel: u8,
        addr: u8,
        channel: u8,
    },
}

impl Bridge {
    pub fn hops(&self) -> u8 {
        match self {
            Bridge::Single { .. } => 1,
            Bridge::Dual { .. } => 2,
        }
    }

    /// Single hop to the drawer controller serving `slot` (1-based).
    pub fn to_drawer(slot: u8) -> Self {
        Bridge::Single {
            addr: DRAWER_CONTROLLER_ADDR,
            channel: channel_for_slot(slot),
        }
    }

    /// Two hops: tray bridge first, then the drawer controller for `slot`.
    pub fn through_tray(slot: u8) -> Self {
        Bridge::Dual {
            transit_addr: TRAY_BRIDGE_ADDR,
            transit_channel: TRAY_BRIDGE_CHANNEL,
            addr: DRAWER_CONTROLLER_ADDR,
            channel: channel_for_slot(slot),
        }
    }
}

/// Bridge channel for a physical slot number. Derived from the slot itself so
/// it stays stable while neighbouring slots come and go.
pub fn channel_for_slot(slot: u8) -> u8 {
    debug_assert!(slot >= 1, "slots are 1-based");
    slot.saturating_sub(1) * 2
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub netfn: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
    pub bridge: Option<Bridge>,
}

impl Request {
    pub fn new(netfn: u8, cmd: u8) -> Self {
        Self {
            netfn,
            cmd,
            data: Vec::new(),
            bridge: None,
        }
    }

    pub fn cm(cmd: u8) -> Self {
        Self::new(NETFN_CM, cmd)
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn bridged(mut self, bridge: Bridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// PMBus register access on PSU `slot` (1-based) via the passthrough command.
    pub fn pmbus(slot: u8, op: u8, register: u8) -> Self {
        Self::cm(CMD_PSU_PMBUS).with_data(vec![slot - 1, op, register])
    }

    /// Single-byte PMBus write, e.g. OPERATION on/off.
    pub fn pmbus_write_byte(slot: u8, register: u8, value: u8) -> Self {
        Self::cm(CMD_PSU_PMBUS).with_data(vec![slot - 1, PMBUS_WRITE_BYTE, register, 1, value])
    }

    pub fn get_id_field(field: IdField) -> Self {
        Self::cm(CMD_GET_ID_FIELD).with_data(vec![field.instance()])
    }

    /// 32-bit identity field, most significant byte first.
    pub fn set_id_field(field: IdField, value: u32) -> Self {
        let mut data = vec![ID_FIELD_TYPE_DEFAULT, field.instance(), ID_FIELD_LEN];
        data.extend_from_slice(&value.to_be_bytes());
        Self::cm(CMD_SET_ID_FIELD).with_data(data)
    }

    pub fn lan_config(param: u8) -> Self {
        Self::new(NETFN_TRANSPORT, CMD_GET_LAN_CONFIG).with_data(vec![LAN_CHANNEL, param, 0x00, 0x00])
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "netfn=0x{:02x} cmd=0x{:02x}", self.netfn, self.cmd)?;
        if !self.data.is_empty() {
            write!(f, " data={}", codec::hex(&self.data))?;
        }
        if let Some(bridge) = &self.bridge {
            write!(f, " hops={}", bridge.hops())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: CompletionCode,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(data: impl Into<Vec<u8>>) -> Self {
        Self {
            code: CompletionCode::OK,
            data: data.into(),
        }
    }

    pub fn error(code: u8) -> Self {
        Self {
            code: CompletionCode(code),
            data: Vec::new(),
        }
    }
}

/// Why an exchange did not yield usable data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The device answered with a non-OK completion code
    Code(CompletionCode),
    /// The transport could not deliver a response
    Transport(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Code(code) => write!(f, "completion code {}", code),
            Failure::Transport(reason) => write!(f, "{}", reason),
        }
    }
}

/// Outcome handed to operation completion handlers: response payload or why
/// there is none.
pub type Outcome<'a> = Result<&'a [u8], Failure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_follows_slot_number() {
        assert_eq!(channel_for_slot(1), 0);
        assert_eq!(channel_for_slot(2), 2);
        assert_eq!(channel_for_slot(4), 6);
    }

    #[test]
    fn test_bridge_hops() {
        assert_eq!(Bridge::to_drawer(3).hops(), 1);
        assert_eq!(Bridge::through_tray(3).hops(), 2);
        assert_eq!(
            Bridge::through_tray(3),
            Bridge::Dual {
                transit_addr: 0x10,
                transit_channel: 0x02,
                addr: 0x24,
                channel: 4,
            }
        );
    }

    #[test]
    fn test_pmbus_write_layout() {
        let request = Request::pmbus_write_byte(2, PMBUS_OPERATION, 0x80);
        assert_eq!(request.netfn, NETFN_CM);
        assert_eq!(request.cmd, CMD_PSU_PMBUS);
        assert_eq!(request.data, vec![1, PMBUS_WRITE_BYTE, PMBUS_OPERATION, 1, 0x80]);
    }

    #[test]
    fn test_id_field_layout() {
        assert_eq!(Request::get_id_field(IdField::RackPuid).data, vec![0x01]);
        let request = Request::set_id_field(IdField::DrawerRuid, 0x0102_0306);
        assert_eq!(request.cmd, CMD_SET_ID_FIELD);
        assert_eq!(request.data, vec![0x00, 0x03, 4, 0x01, 0x02, 0x03, 0x06]);
    }

    #[test]
    fn test_lan_config_request() {
        let request = Request::lan_config(LAN_PARAM_SUBNET_MASK);
        assert_eq!((request.netfn, request.cmd), (NETFN_TRANSPORT, CMD_GET_LAN_CONFIG));
        assert_eq!(request.data, vec![0x01, 0x06, 0x00, 0x00]);
    }

    #[test]
    fn test_completion_code_ok_sentinel() {
        assert!(CompletionCode::OK.is_ok());
        assert!(!CompletionCode(0xc1).is_ok());
        assert_eq!(CompletionCode(0xc1).to_string(), "0xc1");
    }
}
