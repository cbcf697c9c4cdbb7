//! Issue and completion handlers for every table operation, grouped by the
//! part of the tree they work on.

pub mod actions;
pub mod cm;
pub mod drawer;
pub mod power;
pub mod thermal;

use tracing::{info, warn};
use uuid::Uuid;

use crate::presence::{Category, HotPlugFlags, PresenceBitmap, Transitions};
use crate::protocol::Outcome;
use crate::scheduler::{OpContext, Step};
use crate::store::{Notifier, UnitRef, ZoneKind};
use crate::tree::{Liveness, NodeKind, Status};

/// Temperature and PWM readings that could not be taken.
pub const SENTINEL_BYTE: u8 = 0xff;
/// Power, current, rpm and status word readings that could not be taken.
pub const SENTINEL_WORD: u16 = 0xffff;
pub const SENTINEL_HEALTH: u8 = 0x80;
pub const SENTINEL_TEXT: &str = "N/A";

/// Response payload of at least `min` bytes, or why there is none.
pub(crate) fn payload<'a>(outcome: Outcome<'a>, min: usize) -> Result<&'a [u8], String> {
    match outcome {
        Ok(data) if data.len() >= min => Ok(data),
        Ok(data) => Err(format!("short response ({} of {} bytes)", data.len(), min)),
        Err(failure) => Err(failure.to_string()),
    }
}

pub(crate) fn done(ok: bool) -> Step {
    Step::Done(if ok { Status::Success } else { Status::Fail })
}

pub(crate) fn slot_of(index: usize) -> u8 {
    index as u8 + 1
}

/// Bring a zone and its subtree online, announcing it on the transition.
pub(crate) fn zone_online(ctx: &mut OpContext<'_>, kind: NodeKind, zone: ZoneKind) {
    let id = ctx.tree.lookup(kind);
    if ctx.tree.node(id).is_online() {
        return;
    }
    ctx.tree.set_liveness(id, Liveness::Online, true);
    info!(cm = ctx.loc_id, ?zone, "Zone online");
    ctx.notify.zone_added(zone, ctx.tree.node(id).uuid);
}

/// Take a zone and its subtree offline and publish an empty presence.
pub(crate) fn zone_offline(ctx: &mut OpContext<'_>, kind: NodeKind, zone: ZoneKind) {
    let id = ctx.tree.lookup(kind);
    warn!(
        cm = ctx.loc_id,
        ?zone,
        failures = ctx.failures + 1,
        "Zone presence unreadable, taking zone offline"
    );
    ctx.tree.set_liveness(id, Liveness::Offline, true);
    ctx.notify.presence(zone, None, 0);
}

/// Diff `current` against `previous` into `flags`, mint an identity for every
/// new unit and retire the identity of every unit that left.
pub(crate) fn track_units<C: Category>(
    notify: &Notifier,
    flags: &mut HotPlugFlags<C>,
    units: &mut [Option<Uuid>],
    previous: PresenceBitmap,
    current: PresenceBitmap,
    unit: impl Fn(u8, Option<Uuid>) -> UnitRef,
) -> Transitions {
    let transitions = flags.apply(previous, current, units.len());

    for index in transitions.removed.iter() {
        let uuid = units[index].take();
        notify.unit_removed(unit(slot_of(index), uuid));
    }
    for index in transitions.added.iter() {
        let uuid = Uuid::new_v4();
        units[index] = Some(uuid);
        notify.unit_added(unit(slot_of(index), Some(uuid)));
    }
    transitions
}

/// Integer mean, or None for an empty set.
pub(crate) fn average(values: impl Iterator<Item = i64>) -> Option<i64> {
    let (sum, count) = values.fold((0i64, 0i64), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::presence::{PsuAttr, MAX_PSU};
    use crate::protocol::{CompletionCode, Failure};
    use crate::store::{EventKind, MemoryStore, UnitKind};

    #[test]
    fn test_payload_length_check() {
        let data = [1u8, 2];
        assert_eq!(payload(Ok(&data[..]), 2), Ok(&data[..]));
        assert!(payload(Ok(&data[..1]), 2).unwrap_err().contains("short response"));
        assert_eq!(
            payload(Err(Failure::Code(CompletionCode(0xc3))), 1),
            Err("completion code 0xc3".to_string())
        );
    }

    #[test]
    fn test_track_units_mints_and_retires_identities() {
        let store = Arc::new(MemoryStore::default());
        let notify = Notifier::new(1, store.clone());
        let mut flags = HotPlugFlags::<PsuAttr>::default();
        let mut units = [None; MAX_PSU];

        let first = PresenceBitmap::new(0b011, MAX_PSU);
        track_units(&notify, &mut flags, &mut units, PresenceBitmap::EMPTY, first, |slot, uuid| {
            UnitRef::new(UnitKind::Psu, slot, uuid)
        });
        let minted = units[1].expect("slot 2 identity");
        assert!(units[0].is_some());
        assert!(flags.is_added(PsuAttr::Serial, 1));

        store.clear();
        let second = PresenceBitmap::new(0b001, MAX_PSU);
        let transitions = track_units(&notify, &mut flags, &mut units, first, second, |slot, uuid| {
            UnitRef::new(UnitKind::Psu, slot, uuid)
        });

        assert_eq!(transitions.removed.bits(), 0b010);
        assert_eq!(units[1], None);
        assert_eq!(
            store.events(),
            vec![EventKind::UnitRemoved {
                unit: UnitRef::new(UnitKind::Psu, 2, Some(minted))
            }]
        );
    }

    #[test]
    fn test_average() {
        assert_eq!(average([30, 40, 50].into_iter()), Some(40));
        assert_eq!(average(std::iter::empty()), None);
    }
}
