//! Control actions requested from outside the polling loop.

use crate::presence::{MAX_DRAWER, MAX_PSU};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Switch a PSU output on or off through PMBus OPERATION
    SetPsuState { slot: u8, enabled: bool },
    ResetPeripheral { peripheral: u8 },
    /// Thermal zone fan duty, 0..=100
    SetZonePwm { pwm: u8 },
    /// Warm reset of the management controller in one drawer
    SoftResetDrawer { drawer: u8 },
    /// Route the rack console UART to `target`. BDC-R reaches the switch
    /// through the controller of `tray`.
    UartSwitch { target: u8, tray: Option<u8> },
    /// Rack-wide; applies to every CM whatever the request names
    SetRackPuid { puid: u32 },
}

fn drawer_in_range(what: &str, drawer: u8) -> Result<(), String> {
    if drawer == 0 || drawer as usize > MAX_DRAWER {
        return Err(format!("Invalid {}: {}. Must be between 1-{}", what, drawer, MAX_DRAWER));
    }
    Ok(())
}

impl Action {
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Action::SetPsuState { slot, .. } if slot == 0 || slot as usize > MAX_PSU => {
                Err(format!("Invalid PSU slot: {}. Must be between 1-{}", slot, MAX_PSU))
            }
            Action::SetZonePwm { pwm } if pwm > 100 => {
                Err(format!("Invalid zone PWM: {}. Must be between 0-100", pwm))
            }
            Action::SoftResetDrawer { drawer } => drawer_in_range("drawer", drawer),
            Action::UartSwitch { target: 0, .. } => Err("Invalid UART target: 0".to_string()),
            Action::UartSwitch { tray: Some(tray), .. } => drawer_in_range("tray", tray),
            Action::SetRackPuid { puid: 0 } => Err("Rack PUID must be non-zero".to_string()),
            _ => Ok(()),
        }
    }
}

/// An action addressed to one chassis manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRequest {
    pub cm: u8,
    pub action: Action,
}
