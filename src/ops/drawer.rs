//! Drawer zone: drawer presence and alerts, drawer and sled telemetry
//! reached through bridged requests, and the per-round drawer summary.
//!
//! The standard platform reads one temperature per drawer over a single hop.
//! BDC-R drawers sit behind a tray bridge and report aggregated sled thermal,
//! health and power data over two hops. Thermal and power chains keep going
//! past a failed drawer; temperature and health chains stop at the first
//! failure.
//!
//! BDC-R drawer controllers also hold identity fields the rack assigns
//! (tray RUID, rack BPID, rack PUID) and report their LAN settings. These are
//! pushed or read only for drawers that are new or whose controller restarted,
//! which shows up as a changed PUID. Those chains also keep going past a
//! failed drawer and leave its flag set for the next round.

use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::config::types::Platform;
use crate::presence::{DrawerAttr, PresenceBitmap, SledAttr, MAX_DRAWER, MAX_SLED};
use crate::protocol::codec::{squeeze_alternate_bits, u16_le};
use crate::protocol::{
    Bridge, IdField, Outcome, Request, CMD_AGGREGATED_HEALTH, CMD_AGGREGATED_THERMAL, CMD_DRAWER_ALERT,
    CMD_DRAWER_PRESENCE, CMD_DRAWER_TEMP, CMD_TRAY_POWER, LAN_PARAM_IP_ADDRESS, LAN_PARAM_IP_SOURCE,
    LAN_PARAM_SUBNET_MASK,
};
use crate::scheduler::{Dispatch, OpContext, Step};
use crate::store::{IdentityField, ReadingKind, UnitKind, UnitRef, ZoneKind};
use crate::tree::{DrawerSlot, NodeKind, Status};

use super::{
    average, done, payload, slot_of, track_units, zone_offline, zone_online, SENTINEL_BYTE, SENTINEL_HEALTH,
    SENTINEL_TEXT, SENTINEL_WORD,
};

fn drawer_unit(ctx: &OpContext<'_>, drawer: u8) -> UnitRef {
    UnitRef::new(
        UnitKind::Drawer,
        drawer,
        ctx.tree.drawer_zone().units[drawer as usize - 1],
    )
}

fn sled_unit(ctx: &OpContext<'_>, drawer: u8, sled: u8) -> UnitRef {
    UnitRef::sled(
        drawer,
        sled,
        ctx.tree.sleds().bays[drawer as usize - 1].units[sled as usize - 1],
    )
}

/// Replace the sled bitmap of one drawer, publishing sled transitions.
fn apply_sleds(ctx: &mut OpContext<'_>, drawer: u8, current: PresenceBitmap) {
    let notify = ctx.notify;
    let bay = &mut ctx.tree.sleds_mut().bays[drawer as usize - 1];
    let previous = bay.present;
    if previous == current {
        return;
    }

    debug!(cm = ctx.loc_id, drawer, %previous, %current, "Sled presence changed");
    let transitions = track_units(notify, &mut bay.flags, &mut bay.units, previous, current, |slot, uuid| {
        UnitRef::sled(drawer, slot, uuid)
    });
    for index in transitions.removed.iter() {
        bay.sleds[index] = Default::default();
    }
    bay.present = current;
    notify.presence(ZoneKind::Drawer, Some(drawer), current.bits());
}

fn apply_drawers(ctx: &mut OpContext<'_>, current: PresenceBitmap) {
    let notify = ctx.notify;
    let zone = ctx.tree.drawer_zone_mut();
    let previous = zone.drawers;
    if previous == current {
        return;
    }

    debug!(cm = ctx.loc_id, %previous, %current, "Drawer presence changed");
    let transitions = track_units(notify, &mut zone.flags, &mut zone.units, previous, current, |slot, uuid| {
        UnitRef::new(UnitKind::Drawer, slot, uuid)
    });
    zone.drawers = current;
    notify.presence(ZoneKind::Drawer, None, current.bits());

    // A pulled drawer takes its sleds with it
    for index in transitions.removed.iter() {
        apply_sleds(ctx, slot_of(index), PresenceBitmap::EMPTY);
    }
}

pub fn issue_drawer_presence(_ctx: &mut OpContext<'_>) -> Step {
    Dispatch::new(Request::cm(CMD_DRAWER_PRESENCE)).into()
}

pub fn complete_drawer_presence(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    match payload(outcome, 1) {
        Ok(data) => {
            let raw = data[0];
            ctx.tree.drawer_zone_mut().raw_present = raw;
            apply_drawers(ctx, PresenceBitmap::new(squeeze_alternate_bits(raw), MAX_DRAWER));
            zone_online(ctx, NodeKind::DrawerZone, ZoneKind::Drawer);
            Step::Done(Status::Success)
        }
        Err(reason) if ctx.streak_exhausted() => {
            debug!(cm = ctx.loc_id, "Drawer presence failed: {}", reason);
            apply_drawers(ctx, PresenceBitmap::EMPTY);
            zone_offline(ctx, NodeKind::DrawerZone, ZoneKind::Drawer);
            Step::Skip
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, failures = ctx.failures + 1, "Drawer presence failed: {}", reason);
            Step::Done(Status::Fail)
        }
    }
}

pub fn issue_drawer_alert(ctx: &mut OpContext<'_>) -> Step {
    if !ctx.tree.is_online(NodeKind::DrawerZone) {
        return Step::Skip;
    }
    Dispatch::new(Request::cm(CMD_DRAWER_ALERT)).into()
}

pub fn complete_drawer_alert(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let (alert, ok) = match payload(outcome, 1) {
        Ok(data) => (data[0], true),
        Err(reason) => {
            debug!(cm = ctx.loc_id, "Drawer alert read failed: {}", reason);
            (0, false)
        }
    };

    let zone = ctx.tree.drawer_zone_mut();
    if zone.alert != alert || !ok {
        zone.alert = alert;
        ctx.notify.alert(alert);
    }
    done(ok)
}

fn next_drawer(ctx: &OpContext<'_>, after: Option<usize>) -> Option<u8> {
    ctx.tree.drawer_zone().drawers.next_present(after).map(slot_of)
}

fn after(drawer: u8) -> Option<usize> {
    Some(drawer as usize - 1)
}

pub fn issue_drawer_temp(ctx: &mut OpContext<'_>) -> Step {
    let removed = ctx.tree.drawer_zone_mut().flags.drain_removed(DrawerAttr::Temperature);
    for index in removed {
        ctx.tree.drawer_group_mut().drawers[index].temperature = 0;
    }
    temp_request(ctx, None)
}

fn temp_request(ctx: &mut OpContext<'_>, from: Option<usize>) -> Step {
    match next_drawer(ctx, from) {
        Some(drawer) => Dispatch::new(Request::cm(CMD_DRAWER_TEMP).bridged(Bridge::to_drawer(drawer)))
            .for_slot(drawer)
            .into(),
        None => Step::Done(Status::Success),
    }
}

fn set_drawer_temp(ctx: &mut OpContext<'_>, drawer: u8, temp: u8) {
    let unit = drawer_unit(ctx, drawer);
    let slot = &mut ctx.tree.drawer_group_mut().drawers[drawer as usize - 1];
    if slot.temperature != temp {
        slot.temperature = temp;
        ctx.notify.reading(unit, ReadingKind::Temperature, temp as i64);
    }
}

pub fn complete_drawer_temp(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };
    match payload(outcome, 1) {
        Ok(data) => {
            set_drawer_temp(ctx, drawer, data[0]);
            ctx.tree
                .drawer_zone_mut()
                .flags
                .consume_added(DrawerAttr::Temperature, drawer as usize - 1);
            temp_request(ctx, after(drawer))
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, drawer, "Drawer temperature read failed: {}", reason);
            set_drawer_temp(ctx, drawer, SENTINEL_BYTE);
            done(false)
        }
    }
}

fn set_drawer_health(ctx: &mut OpContext<'_>, drawer: u8, health: u8) {
    let unit = drawer_unit(ctx, drawer);
    let slot = &mut ctx.tree.drawer_group_mut().drawers[drawer as usize - 1];
    if slot.health != health {
        slot.health = health;
        ctx.notify.health(unit, health as u16);
    }
}

fn health_request(ctx: &mut OpContext<'_>, from: Option<usize>) -> Step {
    match next_drawer(ctx, from) {
        Some(drawer) => Dispatch::new(Request::cm(CMD_AGGREGATED_HEALTH).bridged(Bridge::through_tray(drawer)))
            .for_slot(drawer)
            .into(),
        None => Step::Done(Status::Success),
    }
}

pub fn issue_drawer_health(ctx: &mut OpContext<'_>) -> Step {
    let removed = ctx.tree.drawer_zone_mut().flags.drain_removed(DrawerAttr::Health);
    for index in removed {
        ctx.tree.drawer_group_mut().drawers[index].health = 0;
    }
    health_request(ctx, None)
}

pub fn complete_drawer_health(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };
    match payload(outcome, 1) {
        Ok(data) => {
            set_drawer_health(ctx, drawer, data[0]);
            ctx.tree
                .drawer_zone_mut()
                .flags
                .consume_added(DrawerAttr::Health, drawer as usize - 1);
            health_request(ctx, after(drawer))
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, drawer, "Drawer health read failed: {}", reason);
            set_drawer_health(ctx, drawer, SENTINEL_HEALTH);
            done(false)
        }
    }
}

/// Per-sled thermal record: type, PWM, inlet temperature.
const THERMAL_RECORD: usize = 3;
const POWER_RECORD: usize = 2;

/// Sled bitmap plus one fixed-size record per present sled, in slot order.
fn sled_records(data: &[u8], record: usize) -> Option<(PresenceBitmap, Vec<(usize, &[u8])>)> {
    let (&bitmap, rest) = data.split_first()?;
    let present = PresenceBitmap::new(bitmap, MAX_SLED);
    if rest.len() < present.count() * record {
        return None;
    }
    let records = present.iter().zip(rest.chunks_exact(record)).collect();
    Some((present, records))
}

fn thermal_request(ctx: &mut OpContext<'_>, from: Option<usize>) -> Step {
    match next_drawer(ctx, from) {
        Some(drawer) => Dispatch::new(Request::cm(CMD_AGGREGATED_THERMAL).bridged(Bridge::through_tray(drawer)))
            .for_slot(drawer)
            .into(),
        None => done(!ctx.tree.sleds().chain_failed),
    }
}

pub fn issue_drawer_thermal(ctx: &mut OpContext<'_>) -> Step {
    // Sled data of a pulled drawer went with its bay
    ctx.tree.drawer_zone_mut().flags.drain_removed(DrawerAttr::Thermal);
    let sleds = ctx.tree.sleds_mut();
    sleds.chain_failed = false;
    for bay in sleds.bays.iter_mut() {
        bay.flags.drain_removed(SledAttr::Kind);
    }
    thermal_request(ctx, None)
}

#[derive(Debug, Clone, Copy)]
enum SledByte {
    Pwm,
    Inlet,
}

fn set_sled_byte(ctx: &mut OpContext<'_>, drawer: u8, sled: u8, which: SledByte, value: u8) {
    let unit = sled_unit(ctx, drawer, sled);
    let slot = &mut ctx.tree.sleds_mut().bays[drawer as usize - 1].sleds[sled as usize - 1];
    let (field, kind) = match which {
        SledByte::Pwm => (&mut slot.pwm, ReadingKind::Pwm),
        SledByte::Inlet => (&mut slot.inlet_temp, ReadingKind::InletTemperature),
    };
    if *field != value {
        *field = value;
        ctx.notify.reading(unit, kind, value as i64);
    }
}

pub fn complete_drawer_thermal(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };
    let bay = drawer as usize - 1;

    match payload(outcome, 1).map(|data| sled_records(data, THERMAL_RECORD)) {
        Ok(Some((present, records))) => {
            apply_sleds(ctx, drawer, present);
            for (index, record) in records {
                let sled = slot_of(index);
                let kind = record[0];
                ctx.tree.sleds_mut().bays[bay].sleds[index].kind = kind;
                if ctx.tree.sleds_mut().bays[bay].flags.consume_added(SledAttr::Kind, index) {
                    let unit = sled_unit(ctx, drawer, sled);
                    ctx.notify.identity(unit, IdentityField::SledType, &kind.to_string());
                }
                set_sled_byte(ctx, drawer, sled, SledByte::Pwm, record[1]);
                set_sled_byte(ctx, drawer, sled, SledByte::Inlet, record[2]);
            }
            ctx.tree
                .drawer_zone_mut()
                .flags
                .consume_added(DrawerAttr::Thermal, bay);
        }
        result => {
            let reason = match result {
                Err(reason) => reason,
                _ => "malformed sled records".to_string(),
            };
            debug!(cm = ctx.loc_id, drawer, "Aggregated thermal read failed: {}", reason);
            let present = ctx.tree.sleds().bays[bay].present;
            for index in present.iter() {
                set_sled_byte(ctx, drawer, slot_of(index), SledByte::Pwm, SENTINEL_BYTE);
                set_sled_byte(ctx, drawer, slot_of(index), SledByte::Inlet, SENTINEL_BYTE);
            }
            ctx.tree.sleds_mut().chain_failed = true;
        }
    }

    thermal_request(ctx, after(drawer))
}

fn power_request(ctx: &mut OpContext<'_>, from: Option<usize>) -> Step {
    match next_drawer(ctx, from) {
        Some(drawer) => Dispatch::new(Request::cm(CMD_TRAY_POWER).bridged(Bridge::through_tray(drawer)))
            .for_slot(drawer)
            .into(),
        None => done(!ctx.tree.sleds().chain_failed),
    }
}

pub fn issue_drawer_power(ctx: &mut OpContext<'_>) -> Step {
    for index in ctx.tree.drawer_zone_mut().flags.drain_removed(DrawerAttr::Power) {
        ctx.tree.drawer_group_mut().drawers[index].power = 0;
    }
    let sleds = ctx.tree.sleds_mut();
    sleds.chain_failed = false;
    for bay in sleds.bays.iter_mut() {
        for index in bay.flags.drain_removed(SledAttr::Power) {
            bay.sleds[index].power = 0;
        }
    }
    power_request(ctx, None)
}

fn set_sled_power(ctx: &mut OpContext<'_>, drawer: u8, sled: u8, watts: u16) {
    let unit = sled_unit(ctx, drawer, sled);
    let slot = &mut ctx.tree.sleds_mut().bays[drawer as usize - 1].sleds[sled as usize - 1];
    if slot.power != watts {
        slot.power = watts;
        ctx.notify.reading(unit, ReadingKind::SledPower, watts as i64);
    }
}

pub fn complete_drawer_power(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };
    let bay = drawer as usize - 1;

    match payload(outcome, 1).map(|data| sled_records(data, POWER_RECORD)) {
        Ok(Some((_, records))) => {
            for (index, record) in records {
                let watts = u16_le(record, 0).unwrap_or(SENTINEL_WORD);
                set_sled_power(ctx, drawer, slot_of(index), watts);
                ctx.tree.sleds_mut().bays[bay].flags.consume_added(SledAttr::Power, index);
            }
            ctx.tree.drawer_zone_mut().flags.consume_added(DrawerAttr::Power, bay);
        }
        result => {
            let reason = match result {
                Err(reason) => reason,
                _ => "malformed sled records".to_string(),
            };
            debug!(cm = ctx.loc_id, drawer, "Tray power read failed: {}", reason);
            let present = ctx.tree.sleds().bays[bay].present;
            for index in present.iter() {
                set_sled_power(ctx, drawer, slot_of(index), SENTINEL_WORD);
            }
            ctx.tree.sleds_mut().chain_failed = true;
        }
    }

    power_request(ctx, after(drawer))
}

/// Fold sled data into per-drawer figures and the zone temperature.
pub fn issue_drawer_summary(ctx: &mut OpContext<'_>) -> Step {
    let drawers = ctx.tree.drawer_zone().drawers;

    if ctx.settings.platform == Platform::BdcR {
        let switch = ctx.settings.switch_power_watts as i32;
        for index in drawers.iter() {
            let drawer = slot_of(index);
            let bay = &ctx.tree.sleds().bays[index];
            let sleds: Vec<_> = bay.present.iter().map(|i| bay.sleds[i]).collect();

            let power: i32 = sleds
                .iter()
                .filter(|s| s.power != SENTINEL_WORD)
                .map(|s| s.power as i32)
                .sum::<i32>()
                + switch;
            let inlet = average(
                sleds
                    .iter()
                    .filter(|s| s.inlet_temp != SENTINEL_BYTE)
                    .map(|s| s.inlet_temp as i64),
            );

            let unit = drawer_unit(ctx, drawer);
            let slot = &mut ctx.tree.drawer_group_mut().drawers[index];
            if slot.power != power {
                slot.power = power;
                ctx.notify.reading(unit, ReadingKind::DrawerPower, power as i64);
            }
            if let Some(inlet) = inlet {
                set_drawer_temp(ctx, drawer, inlet as u8);
            }
        }
    }

    let temps = ctx.tree.drawer_group().drawers;
    let zone_temp = average(
        drawers
            .iter()
            .map(|index| temps[index].temperature)
            .filter(|&t| t != 0 && t != SENTINEL_BYTE)
            .map(i64::from),
    );
    if let Some(temp) = zone_temp {
        let zone = ctx.tree.drawer_zone_mut();
        if zone.temperature as i64 != temp {
            zone.temperature = temp as i32;
            ctx.notify
                .zone_reading(ZoneKind::Drawer, ReadingKind::Temperature, temp);
        }
    }

    Step::Done(Status::Success)
}

/// Attributes refreshed when a drawer controller comes back with a new PUID.
const REFRESH_ON_RESTART: [DrawerAttr; 6] = [
    DrawerAttr::Ruid,
    DrawerAttr::Bpid,
    DrawerAttr::Puid,
    DrawerAttr::IpAddress,
    DrawerAttr::IpSource,
    DrawerAttr::SubnetMask,
];

/// Start a chain that keeps going past failed drawers.
fn begin_chain(ctx: &mut OpContext<'_>) {
    ctx.tree.drawer_group_mut().chain_failed = false;
}

fn end_chain(ctx: &OpContext<'_>) -> Step {
    done(!ctx.tree.drawer_group().chain_failed)
}

fn fail_link(ctx: &mut OpContext<'_>) {
    ctx.tree.drawer_group_mut().chain_failed = true;
}

/// Next drawer after `from` still flagged for `attr`.
fn next_flagged(ctx: &OpContext<'_>, attr: DrawerAttr, from: Option<usize>) -> Option<u8> {
    ctx.tree.drawer_zone().flags.next_added(attr, from).map(slot_of)
}

/// Value of a 4-byte identity field: max length, field length, then the
/// value most significant byte first.
fn id_field_value(data: &[u8]) -> Result<u32, String> {
    match data {
        [_, 4, a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        [_, 4, ..] => Err("truncated id field".to_string()),
        [_, len, ..] => Err(format!("unexpected id field length {}", len)),
        _ => Err("short id field response".to_string()),
    }
}

fn puid_read_request(ctx: &mut OpContext<'_>, from: Option<usize>) -> Step {
    match next_drawer(ctx, from) {
        Some(drawer) => Dispatch::new(Request::get_id_field(IdField::RackPuid).bridged(Bridge::through_tray(drawer)))
            .for_slot(drawer)
            .into(),
        None => Step::Done(Status::Success),
    }
}

/// Read back the PUID every present drawer holds. A change means the
/// controller restarted (or is new) and needs its identity pushed again.
pub fn issue_drawer_rack_puid(ctx: &mut OpContext<'_>) -> Step {
    for index in ctx.tree.drawer_zone_mut().flags.drain_removed(DrawerAttr::Puid) {
        ctx.tree.drawer_group_mut().drawers[index].puid = 0;
    }
    puid_read_request(ctx, None)
}

pub fn complete_drawer_rack_puid(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };
    let index = drawer as usize - 1;

    match payload(outcome, 2).and_then(id_field_value) {
        Ok(puid) => {
            let slot = &mut ctx.tree.drawer_group_mut().drawers[index];
            if slot.puid != puid {
                info!(
                    cm = ctx.loc_id,
                    drawer,
                    "Drawer controller reports PUID {:#x} (was {:#x}), refreshing its identity",
                    puid,
                    slot.puid
                );
                slot.puid = puid;
                let flags = &mut ctx.tree.drawer_zone_mut().flags;
                for attr in REFRESH_ON_RESTART {
                    flags.mark_added(attr, index);
                }
            }
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, drawer, "Rack PUID read failed: {}", reason);
            ctx.tree.drawer_group_mut().drawers[index].puid = 0;
        }
    }

    puid_read_request(ctx, after(drawer))
}

fn id_value(ctx: &OpContext<'_>, field: IdField, drawer: u8) -> u32 {
    let cm = u32::from(ctx.loc_id.saturating_sub(1));
    match field {
        IdField::DrawerRuid => u32::from(drawer) + cm * MAX_DRAWER as u32,
        IdField::RackBpid => u32::from(ctx.loc_id),
        IdField::RackPuid => ctx.settings.rack_puid,
    }
}

fn id_write(ctx: &OpContext<'_>, field: IdField, drawer: u8) -> Step {
    let value = id_value(ctx, field, drawer);
    Dispatch::new(Request::set_id_field(field, value).bridged(Bridge::through_tray(drawer)))
        .for_slot(drawer)
        .into()
}

fn flagged_write(ctx: &mut OpContext<'_>, field: IdField, attr: DrawerAttr, from: Option<usize>) -> Step {
    match next_flagged(ctx, attr, from) {
        Some(drawer) => id_write(ctx, field, drawer),
        None => end_chain(ctx),
    }
}

fn issue_flagged_write(ctx: &mut OpContext<'_>, field: IdField, attr: DrawerAttr) -> Step {
    // Nothing is kept for a pulled drawer, its pending removal just lapses
    ctx.tree.drawer_zone_mut().flags.drain_removed(attr);
    begin_chain(ctx);
    flagged_write(ctx, field, attr, None)
}

fn complete_flagged_write(ctx: &mut OpContext<'_>, outcome: Outcome<'_>, field: IdField, attr: DrawerAttr) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };
    match outcome {
        Ok(_) => {
            debug!(cm = ctx.loc_id, drawer, ?field, "Identity field written");
            ctx.tree.drawer_zone_mut().flags.consume_added(attr, drawer as usize - 1);
        }
        Err(failure) => {
            debug!(cm = ctx.loc_id, drawer, ?field, "Identity field write failed: {}", failure);
            fail_link(ctx);
        }
    }
    flagged_write(ctx, field, attr, after(drawer))
}

/// Tray RUID: the drawer's position in the rack, counted across CMs.
pub fn issue_drawer_ruid(ctx: &mut OpContext<'_>) -> Step {
    issue_flagged_write(ctx, IdField::DrawerRuid, DrawerAttr::Ruid)
}

pub fn complete_drawer_ruid(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_flagged_write(ctx, outcome, IdField::DrawerRuid, DrawerAttr::Ruid)
}

/// Rack BPID: the location of the CM serving the drawer.
pub fn issue_drawer_rack_bpid(ctx: &mut OpContext<'_>) -> Step {
    issue_flagged_write(ctx, IdField::RackBpid, DrawerAttr::Bpid)
}

pub fn complete_drawer_rack_bpid(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_flagged_write(ctx, outcome, IdField::RackBpid, DrawerAttr::Bpid)
}

/// Next present drawer that holds a stale PUID or is flagged for a push.
fn next_puid_target(ctx: &OpContext<'_>, from: Option<usize>) -> Option<u8> {
    let rack = ctx.settings.rack_puid;
    let zone = ctx.tree.drawer_zone();
    let drawers = &ctx.tree.drawer_group().drawers;

    let mut cursor = from;
    while let Some(index) = zone.drawers.next_present(cursor) {
        if drawers[index].puid != rack || zone.flags.is_added(DrawerAttr::Puid, index) {
            return Some(slot_of(index));
        }
        cursor = Some(index);
    }
    None
}

fn puid_push_request(ctx: &mut OpContext<'_>, from: Option<usize>) -> Step {
    match next_puid_target(ctx, from) {
        Some(drawer) => id_write(ctx, IdField::RackPuid, drawer),
        None => end_chain(ctx),
    }
}

/// Push the rack PUID to drawers that do not hold it yet.
pub fn issue_drawer_rack_puid_push(ctx: &mut OpContext<'_>) -> Step {
    if ctx.settings.rack_puid == 0 {
        return Step::Done(Status::Success);
    }
    begin_chain(ctx);
    puid_push_request(ctx, None)
}

pub fn complete_drawer_rack_puid_push(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };
    let index = drawer as usize - 1;

    match outcome {
        Ok(_) => {
            ctx.tree.drawer_group_mut().drawers[index].puid = ctx.settings.rack_puid;
            ctx.tree.drawer_zone_mut().flags.consume_added(DrawerAttr::Puid, index);
        }
        Err(failure) => {
            debug!(cm = ctx.loc_id, drawer, "Rack PUID write failed: {}", failure);
            ctx.tree.drawer_group_mut().drawers[index].puid = 0;
            fail_link(ctx);
        }
    }
    puid_push_request(ctx, after(drawer))
}

/// LAN configuration parameters read from each drawer controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LanParam {
    IpAddress,
    IpSource,
    SubnetMask,
}

impl LanParam {
    fn selector(self) -> u8 {
        match self {
            LanParam::IpAddress => LAN_PARAM_IP_ADDRESS,
            LanParam::IpSource => LAN_PARAM_IP_SOURCE,
            LanParam::SubnetMask => LAN_PARAM_SUBNET_MASK,
        }
    }

    fn attr(self) -> DrawerAttr {
        match self {
            LanParam::IpAddress => DrawerAttr::IpAddress,
            LanParam::IpSource => DrawerAttr::IpSource,
            LanParam::SubnetMask => DrawerAttr::SubnetMask,
        }
    }

    fn field(self) -> IdentityField {
        match self {
            LanParam::IpAddress => IdentityField::IpAddress,
            LanParam::IpSource => IdentityField::IpSource,
            LanParam::SubnetMask => IdentityField::SubnetMask,
        }
    }

    fn value_mut(self, slot: &mut DrawerSlot) -> &mut Option<u32> {
        match self {
            LanParam::IpAddress => &mut slot.ip_address,
            LanParam::IpSource => &mut slot.ip_source,
            LanParam::SubnetMask => &mut slot.subnet_mask,
        }
    }

    /// Parameter data following the revision byte.
    fn parse(self, data: &[u8]) -> Result<u32, String> {
        match (self, data) {
            (LanParam::IpSource, [source, ..]) if *source <= 4 => Ok(u32::from(*source)),
            (LanParam::IpSource, [source, ..]) => Err(format!("invalid ip source {}", source)),
            (LanParam::IpAddress, [first, _, _, last, ..]) if matches!(*first, 0 | 0xff) || matches!(*last, 0 | 0xff) => {
                Err(format!("invalid ip address {}", Ipv4Addr::new(data[0], data[1], data[2], data[3])))
            }
            (LanParam::IpAddress | LanParam::SubnetMask, [a, b, c, d, ..]) => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => Err("short lan parameter".to_string()),
        }
    }

    fn render(self, value: Option<u32>) -> String {
        match (self, value) {
            (_, None) => SENTINEL_TEXT.to_string(),
            (LanParam::IpSource, Some(source)) => match source {
                0 => "unspecified",
                1 => "static",
                2 => "dhcp",
                3 => "bios",
                _ => "other",
            }
            .to_string(),
            (_, Some(addr)) => Ipv4Addr::from(addr).to_string(),
        }
    }
}

fn set_lan_value(ctx: &mut OpContext<'_>, drawer: u8, param: LanParam, value: Option<u32>) {
    let unit = drawer_unit(ctx, drawer);
    let current = param.value_mut(&mut ctx.tree.drawer_group_mut().drawers[drawer as usize - 1]);
    if *current != value {
        *current = value;
        ctx.notify.identity(unit, param.field(), &param.render(value));
    }
}

fn lan_request(ctx: &mut OpContext<'_>, param: LanParam, from: Option<usize>) -> Step {
    match next_flagged(ctx, param.attr(), from) {
        Some(drawer) => Dispatch::new(Request::lan_config(param.selector()).bridged(Bridge::through_tray(drawer)))
            .for_slot(drawer)
            .into(),
        None => end_chain(ctx),
    }
}

fn issue_lan(ctx: &mut OpContext<'_>, param: LanParam) -> Step {
    for index in ctx.tree.drawer_zone_mut().flags.drain_removed(param.attr()) {
        *param.value_mut(&mut ctx.tree.drawer_group_mut().drawers[index]) = None;
    }
    begin_chain(ctx);
    lan_request(ctx, param, None)
}

fn complete_lan(ctx: &mut OpContext<'_>, outcome: Outcome<'_>, param: LanParam) -> Step {
    let Some(drawer) = ctx.slot else {
        return Step::Done(Status::Fail);
    };

    match payload(outcome, 1).and_then(|data| param.parse(&data[1..])) {
        Ok(value) => {
            set_lan_value(ctx, drawer, param, Some(value));
            ctx.tree
                .drawer_zone_mut()
                .flags
                .consume_added(param.attr(), drawer as usize - 1);
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, drawer, ?param, "LAN configuration read failed: {}", reason);
            set_lan_value(ctx, drawer, param, None);
            fail_link(ctx);
        }
    }
    lan_request(ctx, param, after(drawer))
}

pub fn issue_drawer_ip(ctx: &mut OpContext<'_>) -> Step {
    issue_lan(ctx, LanParam::IpAddress)
}

pub fn complete_drawer_ip(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_lan(ctx, outcome, LanParam::IpAddress)
}

pub fn issue_drawer_ip_source(ctx: &mut OpContext<'_>) -> Step {
    issue_lan(ctx, LanParam::IpSource)
}

pub fn complete_drawer_ip_source(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_lan(ctx, outcome, LanParam::IpSource)
}

pub fn issue_drawer_subnet_mask(ctx: &mut OpContext<'_>) -> Step {
    issue_lan(ctx, LanParam::SubnetMask)
}

pub fn complete_drawer_subnet_mask(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_lan(ctx, outcome, LanParam::SubnetMask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CompletionCode, Failure};
    use crate::scheduler::table::OpKind;
    use crate::scheduler::testing::{dispatched, is_done, Fixture};
    use crate::store::EventKind;
    use crate::tree::Liveness;

    fn failed() -> Outcome<'static> {
        Err(Failure::Code(CompletionCode(0xc3)))
    }

    fn with_drawers(platform: Platform, raw: u8) -> Fixture {
        let mut fx = Fixture::online(platform);
        let step = complete_drawer_presence(&mut fx.ctx(OpKind::DrawerPresence, None), Ok(&[raw][..]));
        assert!(is_done(&step, Status::Success));
        fx
    }

    #[test]
    fn test_drawer_presence_squeezes_alternate_bits() {
        let fx = with_drawers(Platform::Standard, 0b0001_0001);
        assert_eq!(fx.tree.drawer_zone().drawers.bits(), 0b0101);
        assert!(fx.tree.drawer_zone().units[0].is_some());
        assert!(fx.tree.drawer_zone().units[2].is_some());
        assert!(fx.store.events().contains(&EventKind::Presence {
            zone: ZoneKind::Drawer,
            drawer: None,
            bitmap: 0b0101
        }));
    }

    #[test]
    fn test_pulled_drawer_retires_its_sleds() {
        let mut fx = with_drawers(Platform::BdcR, 0b0000_0001);
        complete_drawer_thermal(
            &mut fx.ctx(OpKind::DrawerThermal, Some(1)),
            Ok(&[0b11, 1, 40, 25, 1, 45, 27][..]),
        );
        assert_eq!(fx.tree.sleds().bays[0].present.count(), 2);
        fx.store.clear();

        complete_drawer_presence(&mut fx.ctx(OpKind::DrawerPresence, None), Ok(&[0][..]));
        let removed = fx
            .store
            .events()
            .into_iter()
            .filter(|e| matches!(e, EventKind::UnitRemoved { unit } if unit.kind == UnitKind::Sled))
            .count();
        assert_eq!(removed, 2);
        assert!(fx.tree.sleds().bays[0].present.is_empty());
    }

    #[test]
    fn test_drawer_zone_offline_after_streak() {
        let mut fx = with_drawers(Platform::Standard, 0b1);
        fx.set_failures(OpKind::DrawerPresence, 2);
        let step = complete_drawer_presence(&mut fx.ctx(OpKind::DrawerPresence, None), failed());
        assert!(matches!(step, Step::Skip));
        assert!(!fx.tree.is_online(NodeKind::DrawerGroup));
        assert!(matches!(issue_drawer_alert(&mut fx.ctx(OpKind::DrawerAlert, None)), Step::Skip));
    }

    #[test]
    fn test_drawer_alert_error_publishes_zero() {
        let mut fx = with_drawers(Platform::Standard, 0b1);
        complete_drawer_alert(&mut fx.ctx(OpKind::DrawerAlert, None), Ok(&[0b10][..]));
        fx.store.clear();

        let step = complete_drawer_alert(&mut fx.ctx(OpKind::DrawerAlert, None), failed());
        assert!(is_done(&step, Status::Fail));
        assert_eq!(fx.store.events(), vec![EventKind::Alert { bitmap: 0 }]);
    }

    #[test]
    fn test_drawer_temp_uses_single_hop_by_slot() {
        let mut fx = with_drawers(Platform::Standard, 0b0001_0001);
        let step = issue_drawer_temp(&mut fx.ctx(OpKind::DrawerTemp, None));
        assert_eq!(
            dispatched(&step).request,
            Request::cm(CMD_DRAWER_TEMP).bridged(Bridge::to_drawer(1))
        );

        let step = complete_drawer_temp(&mut fx.ctx(OpKind::DrawerTemp, Some(1)), Ok(&[31][..]));
        let next = dispatched(&step);
        assert_eq!(next.slot, Some(3));
        assert_eq!(next.request.bridge, Some(Bridge::to_drawer(3)));

        let step = complete_drawer_temp(&mut fx.ctx(OpKind::DrawerTemp, Some(3)), failed());
        assert!(is_done(&step, Status::Fail));
        assert_eq!(fx.tree.drawer_group().drawers[0].temperature, 31);
        assert_eq!(fx.tree.drawer_group().drawers[2].temperature, 0xff);
    }

    #[test]
    fn test_thermal_chain_continues_past_failed_drawer() {
        let mut fx = with_drawers(Platform::BdcR, 0b0000_0101);
        let step = issue_drawer_thermal(&mut fx.ctx(OpKind::DrawerThermal, None));
        assert_eq!(dispatched(&step).request.bridge, Some(Bridge::through_tray(1)));

        let step = complete_drawer_thermal(&mut fx.ctx(OpKind::DrawerThermal, Some(1)), failed());
        assert_eq!(dispatched(&step).slot, Some(2));

        let step = complete_drawer_thermal(
            &mut fx.ctx(OpKind::DrawerThermal, Some(2)),
            Ok(&[0b1, 3, 55, 24][..]),
        );
        assert!(is_done(&step, Status::Fail));

        let sled = fx.tree.sleds().bays[1].sleds[0];
        assert_eq!((sled.kind, sled.pwm, sled.inlet_temp), (3, 55, 24));
        assert!(fx
            .store
            .events()
            .iter()
            .any(|e| matches!(e, EventKind::Identity { field: IdentityField::SledType, value, .. } if value == "3")));
    }

    #[test]
    fn test_truncated_sled_records_are_rejected() {
        assert!(sled_records(&[0b11, 1, 2, 3], THERMAL_RECORD).is_none());
        let (present, records) = sled_records(&[0b101, 0x10, 0x00, 0x20, 0x00], POWER_RECORD).expect("parses");
        assert_eq!(present.bits(), 0b101);
        assert_eq!(records.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_summary_adds_switch_power_and_averages_inlets() {
        let mut fx = with_drawers(Platform::BdcR, 0b0000_0001);
        complete_drawer_thermal(
            &mut fx.ctx(OpKind::DrawerThermal, Some(1)),
            Ok(&[0b11, 1, 40, 24, 1, 45, 28][..]),
        );
        complete_drawer_power(
            &mut fx.ctx(OpKind::DrawerPower, Some(1)),
            Ok(&[0b11, 0x64, 0x00, 0xc8, 0x00][..]),
        );

        let step = issue_drawer_summary(&mut fx.ctx(OpKind::DrawerSummary, None));
        assert!(is_done(&step, Status::Success));

        let drawer = fx.tree.drawer_group().drawers[0];
        assert_eq!(drawer.power, 100 + 200 + 70);
        assert_eq!(drawer.temperature, 26);
        assert_eq!(fx.tree.drawer_zone().temperature, 26);
        assert!(fx.store.events().contains(&EventKind::ZoneReading {
            zone: ZoneKind::Drawer,
            reading: ReadingKind::Temperature,
            value: 26
        }));
    }

    #[test]
    fn test_summary_is_gated_with_the_zone() {
        let mut fx = with_drawers(Platform::Standard, 0b1);
        let dz = fx.tree.lookup(NodeKind::DrawerZone);
        fx.tree.set_liveness(dz, Liveness::Offline, true);
        let dg = fx.tree.lookup(NodeKind::DrawerGroup);
        assert!(fx.tree.parent_offline(dg));
    }

    #[test]
    fn test_changed_puid_refreshes_identity() {
        let mut fx = with_drawers(Platform::BdcR, 0b0000_0001);
        fx.tree.drawer_zone_mut().flags.consume_added(DrawerAttr::Ruid, 0);

        let step = issue_drawer_rack_puid(&mut fx.ctx(OpKind::DrawerRackPuid, None));
        let dispatch = dispatched(&step);
        assert_eq!(dispatch.slot, Some(1));
        assert_eq!(
            dispatch.request,
            Request::get_id_field(IdField::RackPuid).bridged(Bridge::through_tray(1))
        );

        let reply = [0x10, 4, 0x00, 0x00, 0x12, 0x34];
        let step = complete_drawer_rack_puid(&mut fx.ctx(OpKind::DrawerRackPuid, Some(1)), Ok(&reply[..]));
        assert!(is_done(&step, Status::Success));
        assert_eq!(fx.tree.drawer_group().drawers[0].puid, 0x1234);
        assert!(fx.tree.drawer_zone().flags.is_added(DrawerAttr::Ruid, 0));

        // Same PUID again: nothing to refresh
        fx.tree.drawer_zone_mut().flags.consume_added(DrawerAttr::Ruid, 0);
        complete_drawer_rack_puid(&mut fx.ctx(OpKind::DrawerRackPuid, Some(1)), Ok(&reply[..]));
        assert!(!fx.tree.drawer_zone().flags.is_added(DrawerAttr::Ruid, 0));

        // A failed read still ends the chain successfully
        let step = complete_drawer_rack_puid(&mut fx.ctx(OpKind::DrawerRackPuid, Some(1)), failed());
        assert!(is_done(&step, Status::Success));
        assert_eq!(fx.tree.drawer_group().drawers[0].puid, 0);
    }

    #[test]
    fn test_id_field_value_checks_length() {
        assert_eq!(id_field_value(&[0x10, 4, 0, 1, 0, 0]), Ok(0x0001_0000));
        assert!(id_field_value(&[0x10, 4, 0, 1]).is_err());
        assert!(id_field_value(&[0x10, 2, 0, 1, 0, 0]).is_err());
        assert!(id_field_value(&[0x10]).is_err());
    }

    #[test]
    fn test_ruid_counts_drawers_across_cms() {
        let mut fx = with_drawers(Platform::BdcR, 0b0000_0100);
        let mut ctx = fx.ctx(OpKind::DrawerRuid, None);
        ctx.loc_id = 2;
        let step = issue_drawer_ruid(&mut ctx);
        let dispatch = dispatched(&step);
        assert_eq!(dispatch.slot, Some(2));
        assert_eq!(
            dispatch.request,
            Request::set_id_field(IdField::DrawerRuid, 6).bridged(Bridge::through_tray(2))
        );

        let mut ctx = fx.ctx(OpKind::DrawerRuid, Some(2));
        ctx.loc_id = 2;
        let step = complete_drawer_ruid(&mut ctx, Ok(&[][..]));
        assert!(is_done(&step, Status::Success));
        assert!(!fx.tree.drawer_zone().flags.is_added(DrawerAttr::Ruid, 1));
    }

    #[test]
    fn test_identity_chain_continues_past_failure() {
        let mut fx = with_drawers(Platform::BdcR, 0b0001_0001);
        let step = issue_drawer_rack_bpid(&mut fx.ctx(OpKind::DrawerRackBpid, None));
        assert_eq!(
            dispatched(&step).request,
            Request::set_id_field(IdField::RackBpid, 1).bridged(Bridge::through_tray(1))
        );

        let step = complete_drawer_rack_bpid(&mut fx.ctx(OpKind::DrawerRackBpid, Some(1)), failed());
        assert_eq!(dispatched(&step).slot, Some(3));
        let step = complete_drawer_rack_bpid(&mut fx.ctx(OpKind::DrawerRackBpid, Some(3)), Ok(&[][..]));
        assert!(is_done(&step, Status::Fail));

        let flags = &fx.tree.drawer_zone().flags;
        assert!(flags.is_added(DrawerAttr::Bpid, 0));
        assert!(!flags.is_added(DrawerAttr::Bpid, 2));

        // Only the failed drawer is retried
        let step = issue_drawer_rack_bpid(&mut fx.ctx(OpKind::DrawerRackBpid, None));
        assert_eq!(dispatched(&step).slot, Some(1));
        let step = complete_drawer_rack_bpid(&mut fx.ctx(OpKind::DrawerRackBpid, Some(1)), Ok(&[][..]));
        assert!(is_done(&step, Status::Success));
    }

    #[test]
    fn test_puid_push_targets_stale_drawers() {
        let mut fx = with_drawers(Platform::BdcR, 0b0001_0001);
        let step = issue_drawer_rack_puid_push(&mut fx.ctx(OpKind::DrawerRackPuidPush, None));
        assert!(is_done(&step, Status::Success));

        fx.settings.rack_puid = 0x55;
        fx.tree.drawer_group_mut().drawers[0].puid = 0x55;
        fx.tree.drawer_zone_mut().flags.consume_added(DrawerAttr::Puid, 0);

        let step = issue_drawer_rack_puid_push(&mut fx.ctx(OpKind::DrawerRackPuidPush, None));
        let dispatch = dispatched(&step);
        assert_eq!(dispatch.slot, Some(3));
        assert_eq!(
            dispatch.request,
            Request::set_id_field(IdField::RackPuid, 0x55).bridged(Bridge::through_tray(3))
        );

        let step = complete_drawer_rack_puid_push(&mut fx.ctx(OpKind::DrawerRackPuidPush, Some(3)), Ok(&[][..]));
        assert!(is_done(&step, Status::Success));
        assert_eq!(fx.tree.drawer_group().drawers[2].puid, 0x55);

        let step = issue_drawer_rack_puid_push(&mut fx.ctx(OpKind::DrawerRackPuidPush, None));
        assert!(is_done(&step, Status::Success));
    }

    #[test]
    fn test_lan_parameters_parse_and_render() {
        assert_eq!(LanParam::IpAddress.parse(&[10, 0, 0, 5]), Ok(0x0a00_0005));
        assert_eq!(LanParam::IpAddress.render(Some(0x0a00_0005)), "10.0.0.5");
        assert!(LanParam::IpAddress.parse(&[0, 1, 2, 3]).is_err());
        assert!(LanParam::IpAddress.parse(&[10, 0, 0, 255]).is_err());
        assert!(LanParam::IpAddress.parse(&[10, 0]).is_err());

        assert_eq!(LanParam::SubnetMask.parse(&[255, 255, 255, 0]), Ok(0xffff_ff00));
        assert_eq!(LanParam::SubnetMask.render(Some(0xffff_ff00)), "255.255.255.0");

        assert_eq!(LanParam::IpSource.parse(&[2]), Ok(2));
        assert_eq!(LanParam::IpSource.render(Some(2)), "dhcp");
        assert!(LanParam::IpSource.parse(&[5]).is_err());
        assert_eq!(LanParam::IpSource.render(None), SENTINEL_TEXT);
    }

    #[test]
    fn test_drawer_ip_publishes_changes() {
        let mut fx = with_drawers(Platform::BdcR, 0b0000_0001);
        fx.store.clear();

        let step = issue_drawer_ip(&mut fx.ctx(OpKind::DrawerIp, None));
        assert_eq!(
            dispatched(&step).request,
            Request::lan_config(LAN_PARAM_IP_ADDRESS).bridged(Bridge::through_tray(1))
        );

        let step = complete_drawer_ip(&mut fx.ctx(OpKind::DrawerIp, Some(1)), Ok(&[0x11, 192, 168, 1, 20][..]));
        assert!(is_done(&step, Status::Success));
        assert_eq!(fx.tree.drawer_group().drawers[0].ip_address, Some(0xc0a8_0114));
        assert!(!fx.tree.drawer_zone().flags.is_added(DrawerAttr::IpAddress, 0));
        assert!(matches!(
            &fx.store.events()[..],
            [EventKind::Identity { field: IdentityField::IpAddress, value, .. }] if value == "192.168.1.20"
        ));

        // An unusable address reads back as the sentinel and stays flagged
        fx.store.clear();
        fx.tree.drawer_zone_mut().flags.mark_added(DrawerAttr::IpAddress, 0);
        let step = complete_drawer_ip(&mut fx.ctx(OpKind::DrawerIp, Some(1)), Ok(&[0x11, 0, 0, 0, 0][..]));
        assert!(is_done(&step, Status::Fail));
        assert_eq!(fx.tree.drawer_group().drawers[0].ip_address, None);
        assert!(fx.tree.drawer_zone().flags.is_added(DrawerAttr::IpAddress, 0));
        assert!(matches!(
            &fx.store.events()[..],
            [EventKind::Identity { value, .. }] if value == SENTINEL_TEXT
        ));
    }
}
