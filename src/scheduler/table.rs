//! The ordered operation catalogue every CM unit walks once per round.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::config::types::Platform;
use crate::ops::{actions, cm, drawer, power, thermal};
use crate::protocol::Outcome;
use crate::tree::NodeKind;

use super::{OpContext, Step};

macro_rules! op_kinds {
    ($($variant:ident => $name:literal,)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum OpKind {
            $($variant),+
        }

        impl OpKind {
            #[cfg(test)]
            pub const ALL: &'static [OpKind] = &[$(OpKind::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $(OpKind::$variant => $name),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(OpKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

op_kinds! {
    DeviceId => "device_id",
    CmStatus => "cm_status",
    ProcessActions => "process_actions",
    DrawerPresence => "drawer_presence",
    FanPresence => "fan_presence",
    PowerZonePresence => "power_zone_presence",
    PsuPresence => "psu_presence",
    DrawerAlert => "drawer_alert",
    DrawerRackPuid => "drawer_rack_puid",
    DrawerRuid => "drawer_ruid",
    DrawerRackBpid => "drawer_rack_bpid",
    DrawerRackPuidPush => "drawer_rack_puid_push",
    DrawerThermal => "drawer_thermal",
    DrawerHealth => "drawer_health",
    DrawerPower => "drawer_power",
    DrawerIp => "drawer_ip",
    DrawerIpSource => "drawer_ip_source",
    DrawerSubnetMask => "drawer_subnet_mask",
    ZonePwm => "zone_pwm",
    FanSpeed => "fan_speed",
    PsuPowerIn => "psu_power_in",
    PsuCurrentOut => "psu_current_out",
    PsuPowerOut => "psu_power_out",
    DrawerTemp => "drawer_temp",
    PsuSerial => "psu_serial",
    PsuManufacturer => "psu_manufacturer",
    PsuModel => "psu_model",
    PsuFirmware => "psu_firmware",
    PsuPowerCap => "psu_power_cap",
    PsuHealth => "psu_health",
    DrawerSummary => "drawer_summary",
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type IssueFn = fn(&mut OpContext<'_>) -> Step;
pub type CompleteFn = fn(&mut OpContext<'_>, Outcome<'_>) -> Step;

/// Immutable description of one table entry.
#[derive(Clone)]
pub struct OperationDescriptor {
    pub kind: OpKind,
    /// Node whose condition record gates this operation
    pub node: NodeKind,
    pub timeout: Duration,
    pub once: bool,
    /// Only present in the table for this drawer platform
    pub platform: Option<Platform>,
    pub issue: IssueFn,
    /// Handler for dispatched exchanges; `None` records Success/Fail from the
    /// outcome alone
    pub complete: Option<CompleteFn>,
}

impl OperationDescriptor {
    pub fn new(kind: OpKind, node: NodeKind, timeout_ms: u64, issue: IssueFn) -> Self {
        Self {
            kind,
            node,
            timeout: Duration::from_millis(timeout_ms),
            once: false,
            platform: None,
            issue,
            complete: None,
        }
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn only_on(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn on_complete(mut self, complete: CompleteFn) -> Self {
        self.complete = Some(complete);
        self
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("kind", &self.kind)
            .field("node", &self.node)
            .field("timeout", &self.timeout)
            .field("once", &self.once)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OperationTable {
    ops: Vec<OperationDescriptor>,
}

impl OperationTable {
    pub fn new(ops: Vec<OperationDescriptor>) -> Self {
        Self { ops }
    }

    /// The full catalogue filtered to `platform`.
    pub fn standard(platform: Platform) -> Self {
        use NodeKind::*;
        use OpKind::*;

        let all = vec![
            OperationDescriptor::new(DeviceId, Cm, 1000, cm::issue_device_id)
                .once()
                .on_complete(cm::complete_device_id),
            OperationDescriptor::new(CmStatus, Cm, 5000, cm::issue_cm_status).on_complete(cm::complete_cm_status),
            OperationDescriptor::new(ProcessActions, Cm, 1000, actions::issue_process_actions)
                .on_complete(actions::complete_process_actions),
            OperationDescriptor::new(DrawerPresence, DrawerZone, 1000, drawer::issue_drawer_presence)
                .on_complete(drawer::complete_drawer_presence),
            OperationDescriptor::new(FanPresence, ThermalZone, 1000, thermal::issue_fan_presence)
                .on_complete(thermal::complete_fan_presence),
            OperationDescriptor::new(PowerZonePresence, PowerZone, 1000, power::issue_zone_presence)
                .on_complete(power::complete_zone_presence),
            OperationDescriptor::new(PsuPresence, PowerZone, 1000, power::issue_psu_presence)
                .on_complete(power::complete_psu_presence),
            OperationDescriptor::new(DrawerAlert, DrawerZone, 500, drawer::issue_drawer_alert)
                .on_complete(drawer::complete_drawer_alert),
            OperationDescriptor::new(DrawerRackPuid, DrawerGroup, 1000, drawer::issue_drawer_rack_puid)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_rack_puid),
            OperationDescriptor::new(DrawerRuid, DrawerGroup, 1000, drawer::issue_drawer_ruid)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_ruid),
            OperationDescriptor::new(DrawerRackBpid, DrawerGroup, 1000, drawer::issue_drawer_rack_bpid)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_rack_bpid),
            OperationDescriptor::new(DrawerRackPuidPush, DrawerGroup, 1000, drawer::issue_drawer_rack_puid_push)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_rack_puid_push),
            OperationDescriptor::new(DrawerThermal, Sled, 1000, drawer::issue_drawer_thermal)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_thermal),
            OperationDescriptor::new(DrawerHealth, DrawerGroup, 1000, drawer::issue_drawer_health)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_health),
            OperationDescriptor::new(DrawerPower, Sled, 1000, drawer::issue_drawer_power)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_power),
            OperationDescriptor::new(DrawerIp, DrawerGroup, 1000, drawer::issue_drawer_ip)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_ip),
            OperationDescriptor::new(DrawerIpSource, DrawerGroup, 1000, drawer::issue_drawer_ip_source)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_ip_source),
            OperationDescriptor::new(DrawerSubnetMask, DrawerGroup, 1000, drawer::issue_drawer_subnet_mask)
                .only_on(Platform::BdcR)
                .on_complete(drawer::complete_drawer_subnet_mask),
            OperationDescriptor::new(ZonePwm, ThermalZone, 1000, thermal::issue_zone_pwm)
                .on_complete(thermal::complete_zone_pwm),
            OperationDescriptor::new(FanSpeed, FanGroup, 1000, thermal::issue_fan_speed)
                .on_complete(thermal::complete_fan_speed),
            OperationDescriptor::new(PsuPowerIn, PsuGroup, 1000, power::issue_power_in)
                .on_complete(power::complete_power_in),
            OperationDescriptor::new(PsuCurrentOut, PsuGroup, 1000, power::issue_current_out)
                .on_complete(power::complete_current_out),
            OperationDescriptor::new(PsuPowerOut, PsuGroup, 1000, power::issue_power_out)
                .on_complete(power::complete_power_out),
            OperationDescriptor::new(DrawerTemp, DrawerGroup, 1000, drawer::issue_drawer_temp)
                .only_on(Platform::Standard)
                .on_complete(drawer::complete_drawer_temp),
            OperationDescriptor::new(PsuSerial, PsuGroup, 1000, power::issue_serial)
                .on_complete(power::complete_serial),
            OperationDescriptor::new(PsuManufacturer, PsuGroup, 1000, power::issue_manufacturer)
                .on_complete(power::complete_manufacturer),
            OperationDescriptor::new(PsuModel, PsuGroup, 1000, power::issue_model).on_complete(power::complete_model),
            OperationDescriptor::new(PsuFirmware, PsuGroup, 1000, power::issue_firmware)
                .on_complete(power::complete_firmware),
            OperationDescriptor::new(PsuPowerCap, PsuGroup, 1000, power::issue_power_cap)
                .on_complete(power::complete_power_cap),
            OperationDescriptor::new(PsuHealth, PsuGroup, 1000, power::issue_health)
                .on_complete(power::complete_health),
            OperationDescriptor::new(DrawerSummary, DrawerGroup, 1000, drawer::issue_drawer_summary),
        ];

        Self::new(
            all.into_iter()
                .filter(|op| op.platform.map_or(true, |p| p == platform))
                .collect(),
        )
    }

    /// Apply per-operation timeout overrides keyed by operation name.
    /// Unknown names are ignored here; config validation rejects them.
    pub fn with_timeouts(mut self, overrides: &BTreeMap<String, u64>) -> Self {
        for op in &mut self.ops {
            if let Some(ms) = overrides.get(op.kind.name()) {
                op.timeout = Duration::from_millis(*ms);
            }
        }
        self
    }

    pub fn knows(name: &str) -> bool {
        OpKind::from_name(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&OperationDescriptor> {
        self.ops.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.ops.iter()
    }

    /// Operations whose condition records live on nodes of `kind`.
    pub fn ops_for(&self, kind: NodeKind) -> Vec<OpKind> {
        self.ops.iter().filter(|op| op.node == kind).map(|op| op.kind).collect()
    }

    pub fn min_timeout(&self) -> Duration {
        self.ops
            .iter()
            .map(|op| op.timeout)
            .min()
            .unwrap_or(Duration::from_secs(1))
    }
}
