//! Power zone: zone and PSU presence plus every per-PSU attribute poller.
//!
//! Per-PSU pollers share one walker. Each drains its removed row first
//! (resetting the attribute), then chains one exchange per slot: every
//! present slot for readings, only slots still flagged as added for identity
//! data and the power cap. A failed slot stops the chain and fails the
//! operation; the slot's added flag stays set so the next round retries it.

use tracing::debug;

use crate::presence::{PresenceBitmap, PsuAttr, MAX_PSU};
use crate::protocol::codec::{block_string, decode_linear_bytes, u16_le};
use crate::protocol::{
    Outcome, Request, CMD_PSU_CURRENT_OUT, CMD_PSU_POWER_IN, CMD_PSU_PRESENCE, CMD_PZONE_PRESENCE,
    PMBUS_MFR_ID, PMBUS_MFR_MODEL, PMBUS_MFR_POUT_MAX, PMBUS_MFR_REVISION, PMBUS_MFR_SERIAL,
    PMBUS_READ_BLOCK, PMBUS_READ_POUT, PMBUS_READ_WORD, PMBUS_STATUS_WORD,
};
use crate::scheduler::table::OpKind;
use crate::scheduler::{Dispatch, OpContext, Step};
use crate::store::{IdentityField, ReadingKind, UnitKind, UnitRef, ZoneKind};
use crate::tree::{NodeKind, PsuSlot, Status, Tree};

use super::{done, payload, track_units, zone_offline, zone_online, SENTINEL_TEXT, SENTINEL_WORD};

fn psu_unit(tree: &Tree, slot: u8) -> UnitRef {
    UnitRef::new(UnitKind::Psu, slot, tree.power_zone().units[slot as usize - 1])
}

/// The zone is usable only once both presence reads have succeeded.
fn update_zone_state(ctx: &mut OpContext<'_>) {
    let both = [OpKind::PowerZonePresence, OpKind::PsuPresence]
        .iter()
        .all(|&op| op == ctx.op || ctx.tree.status(NodeKind::PowerZone, op) == Status::Success);
    if both {
        zone_online(ctx, NodeKind::PowerZone, ZoneKind::Power);
    }
}

/// Swap in a new PSU bitmap, publishing presence and unit transitions.
fn apply_psus(ctx: &mut OpContext<'_>, current: PresenceBitmap) {
    let notify = ctx.notify;
    let zone = ctx.tree.power_zone_mut();
    let previous = zone.psus;
    if previous == current {
        return;
    }

    debug!(cm = ctx.loc_id, %previous, %current, "PSU presence changed");
    track_units(notify, &mut zone.flags, &mut zone.units, previous, current, |slot, uuid| {
        UnitRef::new(UnitKind::Psu, slot, uuid)
    });
    zone.psus = current;
    notify.presence(ZoneKind::Power, None, current.bits());
}

pub fn issue_zone_presence(_ctx: &mut OpContext<'_>) -> Step {
    Dispatch::new(Request::cm(CMD_PZONE_PRESENCE)).into()
}

pub fn complete_zone_presence(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    match payload(outcome, 1) {
        Ok(data) => {
            let zone = ctx.tree.power_zone_mut();
            if zone.zone_present != data[0] {
                zone.zone_present = data[0];
                debug!(cm = ctx.loc_id, raw = data[0], "Power zone presence changed");
            }
            update_zone_state(ctx);
            Step::Done(Status::Success)
        }
        Err(reason) if ctx.streak_exhausted() => {
            debug!(cm = ctx.loc_id, "Power zone presence failed: {}", reason);
            apply_psus(ctx, PresenceBitmap::EMPTY);
            zone_offline(ctx, NodeKind::PowerZone, ZoneKind::Power);
            Step::Skip
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, failures = ctx.failures + 1, "Power zone presence failed: {}", reason);
            Step::Done(Status::Fail)
        }
    }
}

pub fn issue_psu_presence(ctx: &mut OpContext<'_>) -> Step {
    if ctx.tree.status(NodeKind::PowerZone, OpKind::PowerZonePresence) == Status::Fail {
        return Step::Skip;
    }
    Dispatch::new(Request::cm(CMD_PSU_PRESENCE)).into()
}

pub fn complete_psu_presence(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    match payload(outcome, 1) {
        Ok(data) => {
            apply_psus(ctx, PresenceBitmap::new(data[0], MAX_PSU));
            update_zone_state(ctx);
            Step::Done(Status::Success)
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, failures = ctx.failures + 1, "PSU presence failed: {}", reason);
            if ctx.streak_exhausted() {
                apply_psus(ctx, PresenceBitmap::EMPTY);
            }
            Step::Done(Status::Fail)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Present,
    Added,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reading {
    PowerIn,
    CurrentOut,
    PowerOut,
    PowerCap,
}

impl Reading {
    fn kind(self) -> ReadingKind {
        match self {
            Reading::PowerIn => ReadingKind::PowerIn,
            Reading::CurrentOut => ReadingKind::CurrentOut,
            Reading::PowerOut => ReadingKind::PowerOut,
            Reading::PowerCap => ReadingKind::PowerCap,
        }
    }

    fn field(self, slot: &mut PsuSlot) -> &mut i32 {
        match self {
            Reading::PowerIn => &mut slot.power_in,
            Reading::CurrentOut => &mut slot.current_out,
            Reading::PowerOut => &mut slot.power_out,
            Reading::PowerCap => &mut slot.power_cap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Identity {
    Serial,
    Manufacturer,
    Model,
    Firmware,
}

impl Identity {
    fn field(self) -> IdentityField {
        match self {
            Identity::Serial => IdentityField::Serial,
            Identity::Manufacturer => IdentityField::Manufacturer,
            Identity::Model => IdentityField::Model,
            Identity::Firmware => IdentityField::Firmware,
        }
    }

    fn value(self, slot: &mut PsuSlot) -> &mut Option<String> {
        match self {
            Identity::Serial => &mut slot.serial,
            Identity::Manufacturer => &mut slot.manufacturer,
            Identity::Model => &mut slot.model,
            Identity::Firmware => &mut slot.firmware,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    /// Linear value delivered high byte first
    Direct(Reading),
    /// Linear value read through PMBus, low byte first
    Pmbus(Reading),
    Identity(Identity),
    StatusWord,
}

struct PsuRead {
    attr: PsuAttr,
    walk: Walk,
    request: fn(u8) -> Request,
    field: Field,
}

fn power_in_request(slot: u8) -> Request {
    Request::cm(CMD_PSU_POWER_IN).with_data(vec![slot - 1])
}

fn current_out_request(slot: u8) -> Request {
    Request::cm(CMD_PSU_CURRENT_OUT).with_data(vec![slot - 1])
}

fn power_out_request(slot: u8) -> Request {
    Request::pmbus(slot, PMBUS_READ_WORD, PMBUS_READ_POUT)
}

fn serial_request(slot: u8) -> Request {
    Request::pmbus(slot, PMBUS_READ_BLOCK, PMBUS_MFR_SERIAL)
}

fn manufacturer_request(slot: u8) -> Request {
    Request::pmbus(slot, PMBUS_READ_BLOCK, PMBUS_MFR_ID)
}

fn model_request(slot: u8) -> Request {
    Request::pmbus(slot, PMBUS_READ_BLOCK, PMBUS_MFR_MODEL)
}

fn firmware_request(slot: u8) -> Request {
    Request::pmbus(slot, PMBUS_READ_BLOCK, PMBUS_MFR_REVISION)
}

fn power_cap_request(slot: u8) -> Request {
    Request::pmbus(slot, PMBUS_READ_WORD, PMBUS_MFR_POUT_MAX)
}

fn health_request(slot: u8) -> Request {
    Request::pmbus(slot, PMBUS_READ_WORD, PMBUS_STATUS_WORD)
}

const POWER_IN: PsuRead = PsuRead {
    attr: PsuAttr::PowerIn,
    walk: Walk::Present,
    request: power_in_request,
    field: Field::Direct(Reading::PowerIn),
};

const CURRENT_OUT: PsuRead = PsuRead {
    attr: PsuAttr::CurrentOut,
    walk: Walk::Present,
    request: current_out_request,
    field: Field::Direct(Reading::CurrentOut),
};

const POWER_OUT: PsuRead = PsuRead {
    attr: PsuAttr::PowerOut,
    walk: Walk::Present,
    request: power_out_request,
    field: Field::Pmbus(Reading::PowerOut),
};

const SERIAL: PsuRead = PsuRead {
    attr: PsuAttr::Serial,
    walk: Walk::Added,
    request: serial_request,
    field: Field::Identity(Identity::Serial),
};

const MANUFACTURER: PsuRead = PsuRead {
    attr: PsuAttr::Manufacturer,
    walk: Walk::Added,
    request: manufacturer_request,
    field: Field::Identity(Identity::Manufacturer),
};

const MODEL: PsuRead = PsuRead {
    attr: PsuAttr::Model,
    walk: Walk::Added,
    request: model_request,
    field: Field::Identity(Identity::Model),
};

const FIRMWARE: PsuRead = PsuRead {
    attr: PsuAttr::Firmware,
    walk: Walk::Added,
    request: firmware_request,
    field: Field::Identity(Identity::Firmware),
};

const POWER_CAP: PsuRead = PsuRead {
    attr: PsuAttr::PowerCap,
    walk: Walk::Added,
    request: power_cap_request,
    field: Field::Pmbus(Reading::PowerCap),
};

const HEALTH: PsuRead = PsuRead {
    attr: PsuAttr::Health,
    walk: Walk::Present,
    request: health_request,
    field: Field::StatusWord,
};

fn update_reading(ctx: &mut OpContext<'_>, slot: u8, reading: Reading, value: i32) {
    let unit = psu_unit(ctx.tree, slot);
    let field = reading.field(&mut ctx.tree.psu_group_mut().slots[slot as usize - 1]);
    if *field != value {
        *field = value;
        ctx.notify.reading(unit, reading.kind(), value as i64);
    }
}

fn update_health(ctx: &mut OpContext<'_>, slot: u8, status: u16) {
    let unit = psu_unit(ctx.tree, slot);
    let health = &mut ctx.tree.psu_group_mut().slots[slot as usize - 1].health;
    if *health != status {
        *health = status;
        ctx.notify.health(unit, status);
    }
}

fn set_identity(ctx: &mut OpContext<'_>, slot: u8, identity: Identity, value: Option<String>) {
    let unit = psu_unit(ctx.tree, slot);
    let text = value.clone().unwrap_or_else(|| SENTINEL_TEXT.to_string());
    *identity.value(&mut ctx.tree.psu_group_mut().slots[slot as usize - 1]) = value;
    ctx.notify.identity(unit, identity.field(), &text);
}

/// Decode and record a slot's payload. False when the payload is unusable.
fn store(ctx: &mut OpContext<'_>, field: Field, slot: u8, data: &[u8]) -> bool {
    match field {
        Field::Direct(reading) => {
            let &[high, low, ..] = data else {
                return false;
            };
            update_reading(ctx, slot, reading, decode_linear_bytes(low, high));
        }
        Field::Pmbus(reading) => {
            let &[low, high, ..] = data else {
                return false;
            };
            update_reading(ctx, slot, reading, decode_linear_bytes(low, high));
        }
        Field::Identity(identity) => {
            let Some(text) = block_string(data) else {
                return false;
            };
            set_identity(ctx, slot, identity, Some(text));
        }
        Field::StatusWord => {
            let Some(status) = u16_le(data, 0) else {
                return false;
            };
            update_health(ctx, slot, status);
        }
    }
    true
}

/// Publish the "unknown" value for a slot that could not be read.
fn mark_unknown(ctx: &mut OpContext<'_>, field: Field, slot: u8) {
    match field {
        Field::Direct(Reading::PowerCap) | Field::Pmbus(Reading::PowerCap) => {
            // Keep an unreadable cap out of the zone total
            ctx.tree.psu_group_mut().slots[slot as usize - 1].power_cap = 0;
            let unit = psu_unit(ctx.tree, slot);
            ctx.notify.reading(unit, ReadingKind::PowerCap, SENTINEL_WORD as i64);
        }
        Field::Direct(reading) | Field::Pmbus(reading) => {
            update_reading(ctx, slot, reading, SENTINEL_WORD as i32);
        }
        Field::Identity(identity) => set_identity(ctx, slot, identity, None),
        Field::StatusWord => update_health(ctx, slot, SENTINEL_WORD),
    }
}

fn reset(field: Field, slot: &mut PsuSlot) {
    match field {
        Field::Direct(reading) | Field::Pmbus(reading) => *reading.field(slot) = 0,
        Field::Identity(identity) => *identity.value(slot) = None,
        Field::StatusWord => slot.health = 0,
    }
}

/// Recompute derived zone values once a chain ends.
fn settle(ctx: &mut OpContext<'_>, read: &PsuRead) {
    if read.attr != PsuAttr::PowerCap {
        return;
    }
    let group = ctx.tree.psu_group_mut();
    let total: i32 = group.slots.iter().map(|slot| slot.power_cap).sum();
    if total != group.total_power_cap {
        group.total_power_cap = total;
        ctx.notify
            .zone_reading(ZoneKind::Power, ReadingKind::TotalPowerCap, total as i64);
    }
}

fn next_slot(ctx: &mut OpContext<'_>, read: &PsuRead, after: Option<usize>) -> Step {
    let zone = ctx.tree.power_zone();
    let next = match read.walk {
        Walk::Present => zone.psus.next_present(after),
        Walk::Added => zone.flags.next_added(read.attr, after),
    };

    match next {
        Some(index) => {
            let slot = index as u8 + 1;
            Dispatch::new((read.request)(slot)).for_slot(slot).into()
        }
        None => {
            settle(ctx, read);
            Step::Done(Status::Success)
        }
    }
}

fn issue_read(ctx: &mut OpContext<'_>, read: &PsuRead) -> Step {
    let removed = ctx.tree.power_zone_mut().flags.drain_removed(read.attr);
    let slots = &mut ctx.tree.psu_group_mut().slots;
    for index in removed {
        reset(read.field, &mut slots[index]);
    }
    next_slot(ctx, read, None)
}

fn complete_read(ctx: &mut OpContext<'_>, read: &PsuRead, outcome: Outcome<'_>) -> Step {
    let Some(slot) = ctx.slot else {
        return Step::Done(Status::Fail);
    };

    let stored = match outcome {
        Ok(data) => {
            let stored = store(ctx, read.field, slot, data);
            if !stored {
                debug!(cm = ctx.loc_id, slot, op = %ctx.op, data = ?data, "Unusable PSU response");
            }
            stored
        }
        Err(failure) => {
            debug!(cm = ctx.loc_id, slot, op = %ctx.op, "PSU read failed: {}", failure);
            false
        }
    };

    if !stored {
        mark_unknown(ctx, read.field, slot);
        settle(ctx, read);
        return done(false);
    }

    let index = slot as usize - 1;
    ctx.tree.power_zone_mut().flags.consume_added(read.attr, index);
    next_slot(ctx, read, Some(index))
}

pub fn issue_power_in(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &POWER_IN)
}

pub fn complete_power_in(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &POWER_IN, outcome)
}

pub fn issue_current_out(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &CURRENT_OUT)
}

pub fn complete_current_out(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &CURRENT_OUT, outcome)
}

pub fn issue_power_out(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &POWER_OUT)
}

pub fn complete_power_out(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &POWER_OUT, outcome)
}

pub fn issue_serial(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &SERIAL)
}

pub fn complete_serial(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &SERIAL, outcome)
}

pub fn issue_manufacturer(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &MANUFACTURER)
}

pub fn complete_manufacturer(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &MANUFACTURER, outcome)
}

pub fn issue_model(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &MODEL)
}

pub fn complete_model(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &MODEL, outcome)
}

pub fn issue_firmware(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &FIRMWARE)
}

pub fn complete_firmware(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &FIRMWARE, outcome)
}

pub fn issue_power_cap(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &POWER_CAP)
}

pub fn complete_power_cap(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &POWER_CAP, outcome)
}

pub fn issue_health(ctx: &mut OpContext<'_>) -> Step {
    issue_read(ctx, &HEALTH)
}

pub fn complete_health(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    complete_read(ctx, &HEALTH, outcome)
}
