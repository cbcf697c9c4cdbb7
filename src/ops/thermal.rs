//! Thermal zone: fan presence, zone PWM and fan speeds.

use tracing::{debug, info, warn};

use crate::presence::{FanAttr, PresenceBitmap, MAX_FAN};
use crate::protocol::codec::u16_le;
use crate::protocol::{Outcome, Request, CMD_FAN_PRESENCE, CMD_FAN_SPEED, CMD_SET_ZONE_PWM};
use crate::scheduler::{Dispatch, OpContext, Step};
use crate::store::{ReadingKind, UnitKind, UnitRef, ZoneKind};
use crate::tree::{NodeKind, Status};

use super::{average, done, payload, slot_of, track_units, zone_offline, zone_online, SENTINEL_WORD};

fn apply_fans(ctx: &mut OpContext<'_>, current: PresenceBitmap) {
    let notify = ctx.notify;
    let zone = ctx.tree.thermal_zone_mut();
    let previous = zone.fans;
    if previous == current {
        return;
    }

    debug!(cm = ctx.loc_id, %previous, %current, "Fan presence changed");
    track_units(notify, &mut zone.flags, &mut zone.units, previous, current, |slot, uuid| {
        UnitRef::new(UnitKind::Fan, slot, uuid)
    });
    zone.fans = current;
    notify.presence(ZoneKind::Thermal, None, current.bits());
}

pub fn issue_fan_presence(_ctx: &mut OpContext<'_>) -> Step {
    Dispatch::new(Request::cm(CMD_FAN_PRESENCE)).into()
}

pub fn complete_fan_presence(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    match payload(outcome, 1) {
        Ok(data) => {
            apply_fans(ctx, PresenceBitmap::new(data[0], MAX_FAN));
            zone_online(ctx, NodeKind::ThermalZone, ZoneKind::Thermal);
            Step::Done(Status::Success)
        }
        Err(reason) if ctx.streak_exhausted() => {
            debug!(cm = ctx.loc_id, "Fan presence failed: {}", reason);
            apply_fans(ctx, PresenceBitmap::EMPTY);
            zone_offline(ctx, NodeKind::ThermalZone, ZoneKind::Thermal);
            Step::Skip
        }
        Err(reason) => {
            debug!(cm = ctx.loc_id, failures = ctx.failures + 1, "Fan presence failed: {}", reason);
            Step::Done(Status::Fail)
        }
    }
}

/// Write a pending duty request, if any.
pub fn issue_zone_pwm(ctx: &mut OpContext<'_>) -> Step {
    let zone = ctx.tree.thermal_zone_mut();
    let Some(pwm) = zone.pwm_pending.take() else {
        return Step::Done(Status::Success);
    };
    zone.pwm_writing = Some(pwm);

    Dispatch::new(Request::cm(CMD_SET_ZONE_PWM).with_data(vec![pwm]))
        .with_retry(ctx.write_budget())
        .into()
}

pub fn complete_zone_pwm(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let zone = ctx.tree.thermal_zone_mut();
    let Some(pwm) = zone.pwm_writing.take() else {
        return Step::Done(Status::Fail);
    };

    match outcome {
        Ok(_) => {
            zone.applied_pwm = Some(pwm);
            info!(cm = ctx.loc_id, pwm, "Zone PWM applied");
            ctx.notify
                .zone_reading(ZoneKind::Thermal, ReadingKind::Pwm, pwm as i64);
            Step::Done(Status::Success)
        }
        Err(failure) => {
            warn!(cm = ctx.loc_id, pwm, "Giving up on zone PWM: {}", failure);
            Step::Done(Status::Fail)
        }
    }
}

fn fan_unit(ctx: &OpContext<'_>, slot: u8) -> UnitRef {
    UnitRef::new(UnitKind::Fan, slot, ctx.tree.thermal_zone().units[slot as usize - 1])
}

fn set_speed(ctx: &mut OpContext<'_>, slot: u8, rpm: u16) {
    let unit = fan_unit(ctx, slot);
    let speed = &mut ctx.tree.fan_group_mut().speeds[slot as usize - 1];
    if *speed != rpm {
        *speed = rpm;
        ctx.notify.reading(unit, ReadingKind::FanSpeed, rpm as i64);
    }
}

fn next_fan(ctx: &mut OpContext<'_>, after: Option<usize>) -> Step {
    match ctx.tree.thermal_zone().fans.next_present(after) {
        Some(index) => {
            let slot = slot_of(index);
            Dispatch::new(Request::cm(CMD_FAN_SPEED).with_data(vec![slot - 1]))
                .for_slot(slot)
                .into()
        }
        None => {
            publish_average(ctx);
            Step::Done(Status::Success)
        }
    }
}

fn publish_average(ctx: &mut OpContext<'_>) {
    let fans = ctx.tree.thermal_zone().fans;
    let speeds = ctx.tree.fan_group().speeds;
    let Some(mean) = average(
        fans.iter()
            .map(|index| speeds[index])
            .filter(|&rpm| rpm != SENTINEL_WORD)
            .map(i64::from),
    ) else {
        return;
    };

    let zone = ctx.tree.thermal_zone_mut();
    if zone.average_rpm as i64 != mean {
        zone.average_rpm = mean as u16;
        ctx.notify
            .zone_reading(ZoneKind::Thermal, ReadingKind::AverageRpm, mean);
    }
}

pub fn issue_fan_speed(ctx: &mut OpContext<'_>) -> Step {
    let removed = ctx.tree.thermal_zone_mut().flags.drain_removed(FanAttr::Speed);
    for index in removed {
        ctx.tree.fan_group_mut().speeds[index] = 0;
    }
    next_fan(ctx, None)
}

pub fn complete_fan_speed(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(slot) = ctx.slot else {
        return Step::Done(Status::Fail);
    };

    let rpm = match payload(outcome, 2) {
        Ok(data) => u16_le(data, 0),
        Err(reason) => {
            debug!(cm = ctx.loc_id, slot, "Fan speed read failed: {}", reason);
            None
        }
    };
    let Some(rpm) = rpm else {
        set_speed(ctx, slot, SENTINEL_WORD);
        return done(false);
    };

    set_speed(ctx, slot, rpm);
    let index = slot as usize - 1;
    ctx.tree.thermal_zone_mut().flags.consume_added(FanAttr::Speed, index);
    next_fan(ctx, Some(index))
}
