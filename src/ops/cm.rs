//! Chassis manager identification and liveness.

use tracing::{debug, info, warn};

use crate::protocol::{Outcome, Request, CMD_GET_DEVICE_ID, NETFN_APP};
use crate::scheduler::{Dispatch, OpContext, Step};
use crate::tree::{DeviceInfo, Liveness, NodeKind, Status};

use super::payload;

const DEVICE_ID_LEN: usize = 5;

/// Decode a Get Device ID payload: id, revision, firmware major (low 7
/// bits), firmware minor (BCD), IPMI version nibbles.
pub fn parse_device_id(data: &[u8]) -> Option<DeviceInfo> {
    let &[device_id, revision, major, minor, ipmi, ..] = data else {
        return None;
    };
    Some(DeviceInfo {
        device_id,
        revision,
        firmware: format!("{}.{:02x}", major & 0x7f, minor),
        ipmi_version: format!("{}.{}", ipmi & 0x0f, ipmi >> 4),
    })
}

pub fn issue_device_id(_ctx: &mut OpContext<'_>) -> Step {
    Dispatch::new(Request::new(NETFN_APP, CMD_GET_DEVICE_ID)).into()
}

pub fn complete_device_id(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let info = match payload(outcome, DEVICE_ID_LEN) {
        Ok(data) => parse_device_id(data),
        Err(reason) => {
            debug!(cm = ctx.loc_id, "Get Device ID failed: {}", reason);
            None
        }
    };
    let Some(info) = info else {
        return Step::Done(Status::Fail);
    };

    let root = ctx.tree.root();
    ctx.tree.set_liveness(root, Liveness::Online, false);
    let uuid = ctx.tree.node(root).uuid;

    info!(
        cm = ctx.loc_id,
        firmware = %info.firmware,
        ipmi = %info.ipmi_version,
        "Chassis manager online"
    );
    ctx.notify.cm_added(uuid);
    ctx.notify
        .cm_version(info.device_id, info.revision, &info.firmware, &info.ipmi_version);
    ctx.tree.cm_mut().device = Some(info);

    Step::Done(Status::Success)
}

pub fn issue_cm_status(ctx: &mut OpContext<'_>) -> Step {
    if !ctx.tree.is_online(NodeKind::Cm) {
        return Step::Skip;
    }
    Dispatch::new(Request::new(NETFN_APP, CMD_GET_DEVICE_ID)).into()
}

pub fn complete_cm_status(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let reason = match outcome {
        Ok(_) => return Step::Done(Status::Success),
        Err(failure) => failure,
    };

    if !ctx.streak_exhausted() {
        debug!(cm = ctx.loc_id, failures = ctx.failures + 1, "Liveness probe failed: {}", reason);
        return Step::Done(Status::Fail);
    }

    let firmware = ctx.tree.cm().device.as_ref().map_or("unknown", |device| device.firmware.as_str());
    warn!(cm = ctx.loc_id, firmware, "Chassis manager stopped responding: {}", reason);
    let root = ctx.tree.root();
    ctx.notify.cm_removed(ctx.tree.node(root).uuid);
    ctx.tree.set_liveness(root, Liveness::Offline, true);
    // Records were reset with the subtree; device_id rediscovers the CM
    Step::Skip
}
