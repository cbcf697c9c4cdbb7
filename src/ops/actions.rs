//! Queued control writes.

use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::config::types::Platform;
use crate::protocol::{
    Bridge, Outcome, Request, CMD_PERIPHERAL_RESET, CMD_UART_SWITCH, CMD_WARM_RESET, NETFN_APP, PMBUS_OPERATION,
};
use crate::scheduler::{Dispatch, OpContext, Step};
use crate::store::{UnitKind, UnitRef};
use crate::tree::{NodeKind, Status};

const OPERATION_ON: u8 = 0x80;
const OPERATION_OFF: u8 = 0x00;

pub fn issue_process_actions(ctx: &mut OpContext<'_>) -> Step {
    if !ctx.tree.is_online(NodeKind::Cm) {
        return Step::Skip;
    }
    next_action(ctx)
}

pub fn complete_process_actions(ctx: &mut OpContext<'_>, outcome: Outcome<'_>) -> Step {
    let Some(action) = ctx.actions.pop_front() else {
        return Step::Done(Status::Success);
    };

    match (action, outcome) {
        (Action::SetPsuState { slot, enabled }, Ok(_)) => {
            info!(cm = ctx.loc_id, slot, enabled, "PSU output switched");
            let unit = UnitRef::new(UnitKind::Psu, slot, ctx.tree.power_zone().units[slot as usize - 1]);
            ctx.tree.psu_group_mut().slots[slot as usize - 1].enabled = Some(enabled);
            ctx.notify.psu_state(unit, enabled);
        }
        (Action::SetPsuState { slot, enabled }, Err(failure)) => {
            warn!(cm = ctx.loc_id, slot, enabled, "Giving up on PSU output change: {}", failure);
        }
        (Action::ResetPeripheral { peripheral }, Ok(_)) => {
            info!(cm = ctx.loc_id, peripheral, "Peripheral reset");
        }
        (Action::ResetPeripheral { peripheral }, Err(failure)) => {
            warn!(cm = ctx.loc_id, peripheral, "Peripheral reset failed: {}", failure);
        }
        (Action::SoftResetDrawer { drawer }, Ok(_)) => {
            info!(cm = ctx.loc_id, drawer, "Drawer controller warm reset");
        }
        (Action::SoftResetDrawer { drawer }, Err(failure)) => {
            warn!(cm = ctx.loc_id, drawer, "Drawer controller reset failed: {}", failure);
        }
        (Action::UartSwitch { target, tray }, Ok(_)) => {
            info!(cm = ctx.loc_id, target, ?tray, "UART switched");
        }
        (Action::UartSwitch { target, tray }, Err(failure)) => {
            warn!(cm = ctx.loc_id, target, ?tray, "UART switch failed: {}", failure);
        }
        (Action::SetZonePwm { .. } | Action::SetRackPuid { .. }, _) => {}
    }

    next_action(ctx)
}

/// Dispatch the write for the head of the queue.
fn next_action(ctx: &mut OpContext<'_>) -> Step {
    while let Some(&action) = ctx.actions.front() {
        match action {
            Action::SetPsuState { slot, enabled } => {
                let value = if enabled { OPERATION_ON } else { OPERATION_OFF };
                return Dispatch::new(Request::pmbus_write_byte(slot, PMBUS_OPERATION, value))
                    .for_slot(slot)
                    .with_retry(ctx.write_budget())
                    .into();
            }
            Action::ResetPeripheral { peripheral } => {
                return Dispatch::new(Request::cm(CMD_PERIPHERAL_RESET).with_data(vec![peripheral])).into();
            }
            Action::SoftResetDrawer { drawer } => {
                return Dispatch::new(Request::new(NETFN_APP, CMD_WARM_RESET).bridged(Bridge::through_tray(drawer)))
                    .for_slot(drawer)
                    .into();
            }
            Action::UartSwitch { target, tray } => {
                let request = Request::cm(CMD_UART_SWITCH).with_data(vec![target]);
                match (ctx.settings.platform, tray) {
                    (Platform::Standard, _) => return Dispatch::new(request).into(),
                    (Platform::BdcR, Some(tray)) => {
                        return Dispatch::new(request.bridged(Bridge::to_drawer(tray))).into();
                    }
                    (Platform::BdcR, None) => {
                        warn!(cm = ctx.loc_id, target, "UART switch needs a tray on this platform, dropping it");
                        ctx.actions.pop_front();
                    }
                }
            }
            Action::SetZonePwm { pwm } => {
                // Normally routed straight to the thermal zone
                ctx.actions.pop_front();
                ctx.tree.thermal_zone_mut().pwm_pending = Some(pwm);
            }
            Action::SetRackPuid { puid } => {
                // Rack-wide, applied by the scheduler itself
                ctx.actions.pop_front();
                debug!(cm = ctx.loc_id, puid, "Ignoring queued rack PUID");
            }
        }
    }
    Step::Done(Status::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Platform;
    use crate::protocol::{CompletionCode, Failure};
    use crate::scheduler::table::OpKind;
    use crate::scheduler::testing::{dispatched, is_done, Fixture};
    use crate::store::EventKind;

    #[test]
    fn test_empty_queue_is_done() {
        let mut fx = Fixture::online(Platform::Standard);
        let step = issue_process_actions(&mut fx.ctx(OpKind::ProcessActions, None));
        assert!(is_done(&step, Status::Success));
    }

    #[test]
    fn test_psu_write_carries_retry_budget() {
        let mut fx = Fixture::online(Platform::Standard);
        fx.actions.push_back(Action::SetPsuState { slot: 3, enabled: false });

        let step = issue_process_actions(&mut fx.ctx(OpKind::ProcessActions, None));
        let dispatch = dispatched(&step);
        assert_eq!(dispatch.request, Request::pmbus_write_byte(3, PMBUS_OPERATION, OPERATION_OFF));
        assert_eq!(dispatch.slot, Some(3));
        assert_eq!(dispatch.retry.map(|b| b.remaining()), Some(4));
    }

    #[test]
    fn test_completion_records_state_and_chains() {
        let mut fx = Fixture::online(Platform::Standard);
        fx.actions.push_back(Action::SetPsuState { slot: 1, enabled: true });
        fx.actions.push_back(Action::ResetPeripheral { peripheral: 7 });

        let step = complete_process_actions(&mut fx.ctx(OpKind::ProcessActions, Some(1)), Ok(&[][..]));
        assert_eq!(fx.tree.psu_group().slots[0].enabled, Some(true));
        assert!(matches!(
            fx.store.events()[..],
            [EventKind::PsuState { enabled: true, .. }]
        ));

        let dispatch = dispatched(&step);
        assert_eq!(dispatch.request, Request::cm(CMD_PERIPHERAL_RESET).with_data(vec![7]));
        assert!(dispatch.retry.is_none());

        let step = complete_process_actions(
            &mut fx.ctx(OpKind::ProcessActions, None),
            Err(Failure::Code(CompletionCode(0xc1))),
        );
        assert!(is_done(&step, Status::Success));
        assert!(fx.actions.is_empty());
    }

    #[test]
    fn test_drawer_soft_reset_goes_through_tray() {
        let mut fx = Fixture::online(Platform::BdcR);
        fx.actions.push_back(Action::SoftResetDrawer { drawer: 3 });

        let step = issue_process_actions(&mut fx.ctx(OpKind::ProcessActions, None));
        let dispatch = dispatched(&step);
        assert_eq!(dispatch.request.netfn, NETFN_APP);
        assert_eq!(dispatch.request.cmd, CMD_WARM_RESET);
        assert_eq!(
            dispatch.request.bridge,
            Some(Bridge::Dual {
                transit_addr: 0x10,
                transit_channel: 0x02,
                addr: 0x24,
                channel: 4,
            })
        );
        assert!(dispatch.retry.is_none());
    }

    #[test]
    fn test_uart_switch_routing_follows_platform() {
        let mut fx = Fixture::online(Platform::Standard);
        fx.actions.push_back(Action::UartSwitch { target: 5, tray: None });
        let step = issue_process_actions(&mut fx.ctx(OpKind::ProcessActions, None));
        assert_eq!(dispatched(&step).request, Request::cm(CMD_UART_SWITCH).with_data(vec![5]));

        let mut fx = Fixture::online(Platform::BdcR);
        fx.actions.push_back(Action::UartSwitch { target: 5, tray: Some(2) });
        let step = issue_process_actions(&mut fx.ctx(OpKind::ProcessActions, None));
        assert_eq!(dispatched(&step).request.bridge, Some(Bridge::to_drawer(2)));
    }

    #[test]
    fn test_uart_switch_without_tray_is_dropped_on_bdc_r() {
        let mut fx = Fixture::online(Platform::BdcR);
        fx.actions.push_back(Action::UartSwitch { target: 5, tray: None });
        fx.actions.push_back(Action::ResetPeripheral { peripheral: 2 });

        let step = issue_process_actions(&mut fx.ctx(OpKind::ProcessActions, None));
        assert_eq!(dispatched(&step).request, Request::cm(CMD_PERIPHERAL_RESET).with_data(vec![2]));
        assert_eq!(fx.actions.len(), 1);
    }

    #[test]
    fn test_actions_wait_while_cm_offline() {
        let mut fx = Fixture::online(Platform::Standard);
        let root = fx.tree.root();
        fx.tree.set_liveness(root, crate::tree::Liveness::Offline, true);
        fx.actions.push_back(Action::ResetPeripheral { peripheral: 1 });

        assert!(matches!(issue_process_actions(&mut fx.ctx(OpKind::ProcessActions, None)), Step::Skip));
        assert_eq!(fx.actions.len(), 1);
    }
}
