//! Per-CM resource tree.
//!
//! Nodes live in an arena owned by the tree; parents are plain indices so the
//! child list is the only owning edge. The shape is fixed at construction:
//!
//! ```text
//! Cm ─┬─ PowerZone ── PsuGroup
//!     ├─ ThermalZone ── FanGroup
//!     └─ DrawerZone ── DrawerGroup ── Sled
//! ```

use std::collections::BTreeMap;
use std::time::Instant;

use uuid::Uuid;

use crate::presence::{
    DrawerAttr, FanAttr, HotPlugFlags, PresenceBitmap, PsuAttr, SledAttr, MAX_DRAWER, MAX_FAN, MAX_PSU,
    MAX_SLED,
};
use crate::scheduler::table::{OpKind, OperationTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Cm,
    PowerZone,
    PsuGroup,
    ThermalZone,
    FanGroup,
    DrawerZone,
    DrawerGroup,
    Sled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Unset,
    Success,
    Fail,
}

/// Scheduling state of one operation on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Condition {
    pub status: Status,
    /// Last dispatch time plus the operation's timeout
    pub next_eligible_at: Option<Instant>,
    /// Consecutive `Fail` results
    pub failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u8,
    pub revision: u8,
    pub firmware: String,
    pub ipmi_version: String,
}

#[derive(Debug, Clone, Default)]
pub struct CmData {
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct PowerZoneData {
    /// Raw power-zone presence byte
    pub zone_present: u8,
    pub psus: PresenceBitmap,
    pub flags: HotPlugFlags<PsuAttr>,
    pub units: [Option<Uuid>; MAX_PSU],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PsuSlot {
    pub power_in: i32,
    pub current_out: i32,
    pub power_out: i32,
    pub power_cap: i32,
    pub health: u16,
    pub serial: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    /// Last output state written through OPERATION
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct PsuGroupData {
    pub slots: [PsuSlot; MAX_PSU],
    pub total_power_cap: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ThermalZoneData {
    pub fans: PresenceBitmap,
    pub flags: HotPlugFlags<FanAttr>,
    pub units: [Option<Uuid>; MAX_FAN],
    /// Duty requested but not yet written
    pub pwm_pending: Option<u8>,
    /// Duty currently being written
    pub pwm_writing: Option<u8>,
    pub applied_pwm: Option<u8>,
    pub average_rpm: u16,
}

#[derive(Debug, Clone, Default)]
pub struct FanGroupData {
    pub speeds: [u16; MAX_FAN],
}

#[derive(Debug, Clone, Default)]
pub struct DrawerZoneData {
    /// Presence byte as read, one drawer on every other bit
    pub raw_present: u8,
    pub drawers: PresenceBitmap,
    pub flags: HotPlugFlags<DrawerAttr>,
    pub units: [Option<Uuid>; MAX_DRAWER],
    pub alert: u8,
    pub temperature: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawerSlot {
    pub temperature: u8,
    pub health: u8,
    pub power: i32,
    /// Rack PUID the drawer controller last reported or accepted, 0 if unknown
    pub puid: u32,
    pub ip_address: Option<u32>,
    pub ip_source: Option<u32>,
    pub subnet_mask: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct DrawerGroupData {
    pub drawers: [DrawerSlot; MAX_DRAWER],
    /// Set when any drawer in the current identity or network chain failed
    pub chain_failed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SledSlot {
    pub kind: u8,
    pub pwm: u8,
    pub inlet_temp: u8,
    pub power: u16,
}

/// Sleds behind one drawer controller.
#[derive(Debug, Clone, Default)]
pub struct SledBay {
    pub present: PresenceBitmap,
    pub flags: HotPlugFlags<SledAttr>,
    pub units: [Option<Uuid>; MAX_SLED],
    pub sleds: [SledSlot; MAX_SLED],
}

#[derive(Debug, Clone, Default)]
pub struct SledData {
    pub bays: [SledBay; MAX_DRAWER],
    /// Set when any drawer in the current chain failed
    pub chain_failed: bool,
}

#[derive(Debug, Clone)]
pub enum NodeData {
    Cm(CmData),
    PowerZone(PowerZoneData),
    PsuGroup(PsuGroupData),
    ThermalZone(ThermalZoneData),
    FanGroup(FanGroupData),
    DrawerZone(DrawerZoneData),
    DrawerGroup(DrawerGroupData),
    Sled(SledData),
}

impl NodeData {
    fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Cm => NodeData::Cm(CmData::default()),
            NodeKind::PowerZone => NodeData::PowerZone(PowerZoneData::default()),
            NodeKind::PsuGroup => NodeData::PsuGroup(PsuGroupData::default()),
            NodeKind::ThermalZone => NodeData::ThermalZone(ThermalZoneData::default()),
            NodeKind::FanGroup => NodeData::FanGroup(FanGroupData::default()),
            NodeKind::DrawerZone => NodeData::DrawerZone(DrawerZoneData::default()),
            NodeKind::DrawerGroup => NodeData::DrawerGroup(DrawerGroupData::default()),
            NodeKind::Sled => NodeData::Sled(SledData::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Identity; survives going offline
    pub uuid: Uuid,
    pub liveness: Liveness,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub data: NodeData,
    pub conditions: BTreeMap<OpKind, Condition>,
}

impl Node {
    pub fn is_online(&self) -> bool {
        self.liveness == Liveness::Online
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Tree {
    /// Build the fixed CM subtree with condition records for every operation
    /// in `table` that targets each node kind. Every node starts Offline.
    pub fn new(table: &OperationTable) -> Self {
        let mut tree = Tree {
            nodes: Vec::new(),
            root: NodeId(0),
        };

        let cm = tree.create_node(NodeKind::Cm, None, &table.ops_for(NodeKind::Cm));

        let pz = tree.create_node(NodeKind::PowerZone, Some(cm), &table.ops_for(NodeKind::PowerZone));
        tree.create_node(NodeKind::PsuGroup, Some(pz), &table.ops_for(NodeKind::PsuGroup));

        let tz = tree.create_node(NodeKind::ThermalZone, Some(cm), &table.ops_for(NodeKind::ThermalZone));
        tree.create_node(NodeKind::FanGroup, Some(tz), &table.ops_for(NodeKind::FanGroup));

        let dz = tree.create_node(NodeKind::DrawerZone, Some(cm), &table.ops_for(NodeKind::DrawerZone));
        let dg = tree.create_node(NodeKind::DrawerGroup, Some(dz), &table.ops_for(NodeKind::DrawerGroup));
        tree.create_node(NodeKind::Sled, Some(dg), &table.ops_for(NodeKind::Sled));

        tree.root = cm;
        tree
    }

    /// Allocate a node with empty data and a fresh condition record per
    /// operation, and append it to `parent`'s children.
    pub fn create_node(&mut self, kind: NodeKind, parent: Option<NodeId>, ops: &[OpKind]) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            uuid: Uuid::new_v4(),
            liveness: Liveness::Offline,
            parent,
            children: Vec::new(),
            data: NodeData::empty(kind),
            conditions: ops.iter().map(|op| (*op, Condition::default())).collect(),
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Depth-first search from the root for the node of `kind`.
    ///
    /// # Panics
    /// The tree shape is fixed, so a miss is a programming error.
    pub fn lookup(&self, kind: NodeKind) -> NodeId {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if node.kind == kind {
                return id;
            }
            stack.extend(node.children.iter().rev().copied());
        }
        panic!("resource tree has no {:?} node", kind);
    }

    pub fn is_online(&self, kind: NodeKind) -> bool {
        self.node(self.lookup(kind)).is_online()
    }

    /// True when the node has a parent and that parent is Offline.
    pub fn parent_offline(&self, id: NodeId) -> bool {
        self.node(id)
            .parent
            .is_some_and(|parent| !self.node(parent).is_online())
    }

    /// Change liveness. Going Offline wipes the node's data and condition
    /// records but keeps its uuid. With `cascade` the change applies to every
    /// descendant too.
    pub fn set_liveness(&mut self, id: NodeId, state: Liveness, cascade: bool) {
        let node = &mut self.nodes[id.0];
        node.liveness = state;
        if state == Liveness::Offline {
            node.data = NodeData::empty(node.kind);
            for condition in node.conditions.values_mut() {
                *condition = Condition::default();
            }
        }

        if cascade {
            let children = node.children.clone();
            for child in children {
                self.set_liveness(child, state, true);
            }
        }
    }

    pub fn condition(&self, kind: NodeKind, op: OpKind) -> Option<&Condition> {
        self.node(self.lookup(kind)).conditions.get(&op)
    }

    pub fn condition_mut(&mut self, kind: NodeKind, op: OpKind) -> Option<&mut Condition> {
        let id = self.lookup(kind);
        self.node_mut(id).conditions.get_mut(&op)
    }

    pub fn status(&self, kind: NodeKind, op: OpKind) -> Status {
        self.condition(kind, op).map_or(Status::Unset, |c| c.status)
    }

    #[cfg(test)]
    pub fn uuid(&self, kind: NodeKind) -> Uuid {
        self.node(self.lookup(kind)).uuid
    }
}

macro_rules! data_accessors {
    ($($get:ident, $get_mut:ident => $variant:ident($ty:ty);)+) => {
        impl Tree {
            $(
                pub fn $get(&self) -> &$ty {
                    match &self.node(self.lookup(NodeKind::$variant)).data {
                        NodeData::$variant(data) => data,
                        _ => unreachable!(concat!(stringify!($variant), " node holds foreign data")),
                    }
                }

                pub fn $get_mut(&mut self) -> &mut $ty {
                    let id = self.lookup(NodeKind::$variant);
                    match &mut self.node_mut(id).data {
                        NodeData::$variant(data) => data,
                        _ => unreachable!(concat!(stringify!($variant), " node holds foreign data")),
                    }
                }
            )+
        }
    };
}

data_accessors! {
    cm, cm_mut => Cm(CmData);
    power_zone, power_zone_mut => PowerZone(PowerZoneData);
    psu_group, psu_group_mut => PsuGroup(PsuGroupData);
    thermal_zone, thermal_zone_mut => ThermalZone(ThermalZoneData);
    fan_group, fan_group_mut => FanGroup(FanGroupData);
    drawer_zone, drawer_zone_mut => DrawerZone(DrawerZoneData);
    drawer_group, drawer_group_mut => DrawerGroup(DrawerGroupData);
    sleds, sleds_mut => Sled(SledData);
}
