//! Cooperative asset scheduler.
//!
//! Each configured CM is a `CmUnit` with its own resource tree and cursor
//! into the shared operation table. A round walks the table in order; an
//! operation either resolves on the spot or dispatches one exchange and parks
//! the unit until that exchange's completion arrives. Units never block each
//! other, so one exchange per CM can be outstanding at a time.

pub mod table;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

use crate::actions::{Action, ActionRequest};
use crate::config::types::SchedulerSettings;
use crate::error::TransportError;
use crate::protocol::{Completion, CompletionEvent, Failure, Outcome, Request, RetryBudget, Tag, Transport};
use crate::store::{Notifier, StateStore};
use crate::tree::{Condition, NodeId, NodeKind, Status, Tree};

use table::{OpKind, OperationDescriptor, OperationTable};

/// What an operation handler wants the engine to do next.
#[derive(Debug)]
pub enum Step {
    /// Nothing ran; leave the condition record as it was before arming
    Skip,
    /// Resolved without (further) exchanges
    Done(Status),
    /// Send an exchange and come back through the completion handler
    Dispatch(Dispatch),
}

#[derive(Debug)]
pub struct Dispatch {
    pub request: Request,
    /// 1-based slot the exchange is about, handed back on completion
    pub slot: Option<u8>,
    /// Resend budget for write-class requests
    pub retry: Option<RetryBudget>,
}

impl Dispatch {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            slot: None,
            retry: None,
        }
    }

    pub fn for_slot(mut self, slot: u8) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_retry(mut self, budget: RetryBudget) -> Self {
        self.retry = Some(budget);
        self
    }
}

impl From<Dispatch> for Step {
    fn from(dispatch: Dispatch) -> Self {
        Step::Dispatch(dispatch)
    }
}

/// Everything an issue or completion handler may touch for one CM.
pub struct OpContext<'a> {
    pub loc_id: u8,
    pub op: OpKind,
    /// Slot of the exchange that just completed
    pub slot: Option<u8>,
    /// Consecutive failures recorded for this operation before now
    pub failures: u32,
    pub tree: &'a mut Tree,
    pub actions: &'a mut VecDeque<Action>,
    pub notify: &'a Notifier,
    pub settings: &'a SchedulerSettings,
}

impl OpContext<'_> {
    /// True when one more failure reaches the offline threshold.
    pub fn streak_exhausted(&self) -> bool {
        self.failures + 1 >= self.settings.offline_after_failures
    }

    pub fn write_budget(&self) -> RetryBudget {
        RetryBudget::new(self.settings.write_attempts)
    }
}

/// Readiness of one operation on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Ready,
    /// Not this round; `until` is when it becomes due again, if ever
    Blocked { until: Option<Instant> },
}

/// Parent offline, then one-shot already done, then re-arm window.
pub fn gate(tree: &Tree, node: NodeId, condition: &Condition, once: bool, now: Instant) -> Gate {
    if tree.parent_offline(node) {
        return Gate::Blocked { until: None };
    }
    if once && condition.status == Status::Success {
        return Gate::Blocked { until: None };
    }
    match condition.next_eligible_at {
        Some(at) if at > now => Gate::Blocked { until: Some(at) },
        _ => Gate::Ready,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Busy,
}

#[derive(Debug)]
struct InFlight {
    op: usize,
    generation: u64,
    slot: Option<u8>,
    request: Request,
    retry: Option<RetryBudget>,
    attempts: u32,
    deadline: Instant,
}

enum Flow {
    Advance,
    Wait,
}

/// Scheduling state for one chassis manager.
pub struct CmUnit {
    loc_id: u8,
    tree: Tree,
    cursor: usize,
    state: UnitState,
    /// Earliest time the next round may start
    wake_at: Option<Instant>,
    /// Minimum due time seen during the current round
    round_wake: Option<Instant>,
    in_flight: Option<InFlight>,
    generation: u64,
    actions: VecDeque<Action>,
    notify: Notifier,
    rounds: u64,
}

impl CmUnit {
    fn new(loc_id: u8, table: &OperationTable, store: Arc<dyn StateStore>) -> Self {
        Self {
            loc_id,
            tree: Tree::new(table),
            cursor: 0,
            state: UnitState::Idle,
            wake_at: None,
            round_wake: None,
            in_flight: None,
            generation: 0,
            actions: VecDeque::new(),
            notify: Notifier::new(loc_id, store),
            rounds: 0,
        }
    }

    fn fold_wake(&mut self, at: Instant) {
        self.round_wake = Some(self.round_wake.map_or(at, |current| current.min(at)));
    }

    fn record(&mut self, op: &OperationDescriptor, status: Status) {
        if let Some(condition) = self.tree.condition_mut(op.node, op.kind) {
            condition.status = status;
            match status {
                Status::Success => condition.failures = 0,
                Status::Fail => condition.failures = condition.failures.saturating_add(1),
                Status::Unset => {}
            }
        }
    }
}

#[cfg(test)]
impl CmUnit {
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn wake_at(&self) -> Option<Instant> {
        self.wake_at
    }

    pub fn pending_actions(&self) -> usize {
        self.actions.len()
    }
}

pub struct Scheduler {
    table: Arc<OperationTable>,
    units: Vec<CmUnit>,
    transport: Arc<dyn Transport>,
    completions: UnboundedSender<CompletionEvent>,
    settings: SchedulerSettings,
}

impl Scheduler {
    /// One unit per entry of `loc_ids`; unit `i` is served by the transport
    /// link at index `i`.
    pub fn new(
        table: OperationTable,
        settings: SchedulerSettings,
        loc_ids: &[u8],
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        completions: UnboundedSender<CompletionEvent>,
    ) -> Self {
        let units = loc_ids
            .iter()
            .map(|&loc_id| CmUnit::new(loc_id, &table, Arc::clone(&store)))
            .collect();

        Self {
            table: Arc::new(table),
            units,
            transport,
            completions,
            settings,
        }
    }

    /// Abandon overdue exchanges, then start a round on every idle unit whose
    /// wake time has passed.
    pub fn tick(&mut self, now: Instant) {
        for index in 0..self.units.len() {
            self.abandon_overdue(index, now);

            let unit = &mut self.units[index];
            if unit.state == UnitState::Idle && unit.wake_at.map_or(true, |at| at <= now) {
                unit.state = UnitState::Busy;
                unit.cursor = 0;
                unit.round_wake = None;
                trace!(cm = unit.loc_id, round = unit.rounds + 1, "Starting round");
                self.run_unit(index, now);
            }
        }
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.units
            .iter()
            .map(|unit| match (&unit.state, &unit.in_flight) {
                (UnitState::Busy, Some(flight)) => flight.deadline,
                _ => unit.wake_at.unwrap_or(now),
            })
            .min()
    }

    /// Route a finished exchange back to its unit and resume the cursor.
    pub fn on_completion(&mut self, event: CompletionEvent, now: Instant) {
        let index = event.tag.unit;
        let Some(unit) = self.units.get_mut(index) else {
            warn!(unit = index, "Completion for unknown unit");
            return;
        };

        if unit.in_flight.as_ref().map(|flight| flight.generation) != Some(event.tag.generation) {
            debug!(
                cm = unit.loc_id,
                generation = event.tag.generation,
                "Discarding response for an exchange no longer in flight"
            );
            return;
        }
        let Some(mut flight) = unit.in_flight.take() else {
            return;
        };

        let table = Arc::clone(&self.table);
        let Some(op) = table.get(flight.op) else {
            return;
        };

        let (data, failure) = match event.result {
            Ok(response) if response.code.is_ok() => (response.data, None),
            Ok(response) => (Vec::new(), Some(Failure::Code(response.code))),
            Err(e) => (Vec::new(), Some(Failure::Transport(e.to_string()))),
        };

        if let Some(failure) = &failure {
            if let Some(budget) = flight.retry.as_mut() {
                if budget.spend() {
                    debug!(
                        cm = unit.loc_id,
                        op = %op.kind,
                        attempt = flight.attempts + 1,
                        "Resending after {}", failure
                    );
                    flight.attempts += 1;
                    self.send(index, flight, now);
                    return;
                }
                warn!(
                    cm = unit.loc_id,
                    op = %op.kind,
                    "Giving up after {} attempts: {}", flight.attempts, failure
                );
            }
        }

        let outcome: Outcome<'_> = match failure {
            None => Ok(data.as_slice()),
            Some(failure) => Err(failure),
        };

        let step = match op.complete {
            Some(complete) => {
                let failures = unit.tree.condition(op.node, op.kind).map_or(0, |c| c.failures);
                let mut ctx = OpContext {
                    loc_id: unit.loc_id,
                    op: op.kind,
                    slot: flight.slot,
                    failures,
                    tree: &mut unit.tree,
                    actions: &mut unit.actions,
                    notify: &unit.notify,
                    settings: &self.settings,
                };
                complete(&mut ctx, outcome)
            }
            None => Step::Done(if outcome.is_ok() { Status::Success } else { Status::Fail }),
        };

        if let Flow::Advance = self.apply(index, flight.op, step, None, now) {
            self.units[index].cursor += 1;
            self.run_unit(index, now);
        }
    }

    /// Queue an action for its CM. Zone PWM is recorded on the tree right
    /// away and a rack PUID applies to every CM; everything else waits for
    /// `process_actions`.
    pub fn submit(&mut self, request: ActionRequest, now: Instant) -> bool {
        if let Err(e) = request.action.validate() {
            warn!(cm = request.cm, "Rejected action {:?}: {}", request.action, e);
            return false;
        }

        if let Action::SetRackPuid { puid } = request.action {
            info!(puid, "Rack PUID set, pushing to drawer controllers");
            self.settings.rack_puid = puid;
            for unit in &mut self.units {
                if let Some(condition) = unit
                    .tree
                    .condition_mut(NodeKind::DrawerGroup, OpKind::DrawerRackPuidPush)
                {
                    condition.next_eligible_at = None;
                }
                if unit.state == UnitState::Idle {
                    unit.wake_at = Some(now);
                }
            }
            return true;
        }

        let Some(unit) = self.units.iter_mut().find(|unit| unit.loc_id == request.cm) else {
            warn!(cm = request.cm, "Action for unknown chassis manager: {:?}", request.action);
            return false;
        };

        match request.action {
            Action::SetZonePwm { pwm } => {
                unit.tree.thermal_zone_mut().pwm_pending = Some(pwm);
                if let Some(condition) = unit.tree.condition_mut(NodeKind::ThermalZone, OpKind::ZonePwm) {
                    condition.next_eligible_at = None;
                }
            }
            action => {
                unit.actions.push_back(action);
                if let Some(condition) = unit.tree.condition_mut(NodeKind::Cm, OpKind::ProcessActions) {
                    condition.next_eligible_at = None;
                }
            }
        }
        info!(cm = unit.loc_id, "Queued action: {:?}", request.action);

        if unit.state == UnitState::Idle {
            unit.wake_at = Some(now);
        }
        true
    }

    /// Drive the scheduler until the task is dropped.
    pub async fn run(
        mut self,
        mut completions: UnboundedReceiver<CompletionEvent>,
        mut actions: UnboundedReceiver<ActionRequest>,
    ) {
        info!(
            "Scheduler started: {} chassis manager(s), {} operations",
            self.units.len(),
            self.table.len()
        );
        let mut actions_open = true;

        loop {
            let now = Instant::now();
            self.tick(now);
            let wake = self.next_wake(now).unwrap_or(now + self.table.min_timeout());

            tokio::select! {
                Some(event) = completions.recv() => {
                    self.on_completion(event, Instant::now());
                }
                request = actions.recv(), if actions_open => match request {
                    Some(request) => {
                        self.submit(request, Instant::now());
                    }
                    None => {
                        debug!("Action channel closed");
                        actions_open = false;
                    }
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            }
        }
    }

    /// Run until every unit has finished at least one round.
    pub async fn run_once(&mut self, completions: &mut UnboundedReceiver<CompletionEvent>) {
        self.tick(Instant::now());
        while self.units.iter().any(|unit| unit.rounds == 0) {
            let now = Instant::now();
            let wake = self.next_wake(now).unwrap_or(now);

            tokio::select! {
                Some(event) = completions.recv() => {
                    self.on_completion(event, Instant::now());
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    self.tick(Instant::now());
                }
            }
        }
    }

    fn abandon_overdue(&mut self, index: usize, now: Instant) {
        let unit = &self.units[index];
        let Some(flight) = unit.in_flight.as_ref().filter(|flight| flight.deadline <= now) else {
            return;
        };

        let op = self.table.get(flight.op).map_or("?", |op| op.kind.name());
        warn!(cm = unit.loc_id, op, request = %flight.request, "Abandoning overdue exchange");
        let tag = Tag {
            unit: index,
            generation: flight.generation,
        };
        self.on_completion(
            CompletionEvent {
                tag,
                result: Err(TransportError::Abandoned),
            },
            now,
        );
    }

    /// Walk the cursor until an operation dispatches or the table ends.
    fn run_unit(&mut self, index: usize, now: Instant) {
        let table = Arc::clone(&self.table);

        loop {
            let unit = &mut self.units[index];
            let op_index = unit.cursor;
            let Some(op) = table.get(op_index) else {
                self.finish_round(index, now);
                return;
            };

            let node = unit.tree.lookup(op.node);
            let condition = unit.tree.node(node).conditions.get(&op.kind).copied().unwrap_or_default();

            match gate(&unit.tree, node, &condition, op.once, now) {
                Gate::Blocked { until } => {
                    if let Some(at) = until {
                        unit.fold_wake(at);
                    }
                    unit.cursor += 1;
                    continue;
                }
                Gate::Ready => {}
            }

            // Armed at dispatch so a lost response cannot wedge the schedule
            let armed = now + op.timeout;
            if let Some(record) = unit.tree.node_mut(node).conditions.get_mut(&op.kind) {
                record.next_eligible_at = Some(armed);
            }
            unit.fold_wake(armed);

            let mut ctx = OpContext {
                loc_id: unit.loc_id,
                op: op.kind,
                slot: None,
                failures: condition.failures,
                tree: &mut unit.tree,
                actions: &mut unit.actions,
                notify: &unit.notify,
                settings: &self.settings,
            };
            let step = (op.issue)(&mut ctx);
            trace!(cm = unit.loc_id, op = %op.kind, ?step, "Issued");

            match self.apply(index, op_index, step, Some(condition.next_eligible_at), now) {
                Flow::Advance => self.units[index].cursor += 1,
                Flow::Wait => return,
            }
        }
    }

    fn apply(
        &mut self,
        index: usize,
        op_index: usize,
        step: Step,
        previous: Option<Option<Instant>>,
        now: Instant,
    ) -> Flow {
        let table = Arc::clone(&self.table);
        let Some(op) = table.get(op_index) else {
            return Flow::Advance;
        };
        let unit = &mut self.units[index];

        match step {
            Step::Skip => {
                if let Some(previous) = previous {
                    if let Some(record) = unit.tree.condition_mut(op.node, op.kind) {
                        record.next_eligible_at = previous;
                    }
                }
                Flow::Advance
            }
            Step::Done(status) => {
                unit.record(op, status);
                Flow::Advance
            }
            Step::Dispatch(dispatch) => {
                let flight = InFlight {
                    op: op_index,
                    generation: 0,
                    slot: dispatch.slot,
                    request: dispatch.request,
                    retry: dispatch.retry,
                    attempts: 1,
                    deadline: now,
                };
                self.send(index, flight, now);
                Flow::Wait
            }
        }
    }

    /// Put `flight` on the wire under a fresh generation.
    fn send(&mut self, index: usize, mut flight: InFlight, now: Instant) {
        let timeout = self
            .table
            .get(flight.op)
            .map_or(Duration::ZERO, |op| op.timeout);
        let unit = &mut self.units[index];

        unit.generation += 1;
        flight.generation = unit.generation;
        flight.deadline = now + timeout + Duration::from_millis(self.settings.response_grace_ms);

        let tag = Tag {
            unit: index,
            generation: flight.generation,
        };
        let request = flight.request.clone();
        trace!(cm = unit.loc_id, generation = tag.generation, %request, "Dispatching");
        unit.in_flight = Some(flight);

        self.transport
            .dispatch(request, Completion::new(tag, self.completions.clone()));
    }

    fn finish_round(&mut self, index: usize, now: Instant) {
        let fallback = now + self.table.min_timeout();
        let unit = &mut self.units[index];
        unit.state = UnitState::Idle;
        unit.cursor = 0;
        unit.rounds += 1;
        unit.wake_at = Some(unit.round_wake.take().unwrap_or(fallback));
        trace!(cm = unit.loc_id, round = unit.rounds, "Round complete");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Harness;
    use super::*;
    use crate::config::types::Platform;
    use crate::protocol::{Response, PMBUS_OPERATION};
    use crate::tree::Liveness;

    fn done(_ctx: &mut OpContext<'_>) -> Step {
        Step::Done(Status::Success)
    }

    fn ping(_ctx: &mut OpContext<'_>) -> Step {
        Dispatch::new(Request::cm(0x7f)).into()
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings::default()
    }

    #[test]
    fn test_cursor_wraps_after_sync_ops() {
        let kinds = [OpKind::DeviceId, OpKind::CmStatus, OpKind::ProcessActions, OpKind::DrawerSummary];
        let table = OperationTable::new(
            kinds
                .iter()
                .map(|&kind| table::OperationDescriptor::new(kind, NodeKind::Cm, 1000, done))
                .collect(),
        );
        let mut h = Harness::new(table, settings());
        h.tick();

        assert_eq!(h.unit().state(), UnitState::Idle);
        assert_eq!(h.unit().cursor(), 0);
        assert_eq!(h.unit().rounds(), 1);
        assert_eq!(h.sent_count(), 0);
        for kind in kinds {
            assert_eq!(h.unit().tree().status(NodeKind::Cm, kind), Status::Success);
        }
    }

    #[test]
    fn test_parent_offline_blocks_regardless_of_condition() {
        let table = OperationTable::new(vec![table::OperationDescriptor::new(
            OpKind::PsuPresence,
            NodeKind::PowerZone,
            1000,
            ping,
        )]);
        let mut h = Harness::new(table, settings());

        // Condition says due long ago, parent (CM) still offline
        let past = h.now;
        h.tree_mut()
            .condition_mut(NodeKind::PowerZone, OpKind::PsuPresence)
            .expect("condition")
            .next_eligible_at = Some(past);
        h.advance(5000);
        h.tick();
        assert_eq!(h.sent_count(), 0);
        assert_eq!(h.unit().state(), UnitState::Idle);

        let root = h.unit().tree().root();
        h.tree_mut().set_liveness(root, Liveness::Online, false);
        h.advance(1000);
        h.tick();
        assert_eq!(h.sent_count(), 1);
        assert_eq!(h.unit().state(), UnitState::Busy);
    }

    #[test]
    fn test_once_operation_never_repeats() {
        let table = OperationTable::new(vec![
            table::OperationDescriptor::new(OpKind::DeviceId, NodeKind::Cm, 1000, ping).once(),
        ]);
        let mut h = Harness::new(table, settings());

        h.tick();
        h.respond_ok(&[0x20]);
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::DeviceId), Status::Success);

        for _ in 0..10 {
            h.advance(2000);
            h.tick();
        }
        assert_eq!(h.sent_count(), 1);
        assert!(h.unit().rounds() >= 10);
    }

    #[test]
    fn test_failed_once_operation_retries_after_timeout() {
        let table = OperationTable::new(vec![
            table::OperationDescriptor::new(OpKind::DeviceId, NodeKind::Cm, 1000, ping).once(),
        ]);
        let mut h = Harness::new(table, settings());

        h.tick();
        h.respond(Ok(Response::error(0xc3)));
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::DeviceId), Status::Fail);

        h.advance(500);
        h.tick();
        assert_eq!(h.sent_count(), 1);

        h.advance(500);
        h.tick();
        assert_eq!(h.sent_count(), 2);
    }

    #[test]
    fn test_unit_sleeps_until_next_due() {
        let table = OperationTable::new(vec![table::OperationDescriptor::new(
            OpKind::CmStatus,
            NodeKind::Cm,
            5000,
            ping,
        )]);
        let mut h = Harness::new(table, settings());
        let start = h.now;

        h.tick();
        h.advance(100);
        h.respond_ok(&[]);
        assert_eq!(h.unit().wake_at(), Some(start + Duration::from_millis(5000)));
        assert_eq!(h.scheduler.next_wake(h.now), Some(start + Duration::from_millis(5000)));
    }

    #[test]
    fn test_overdue_exchange_is_abandoned_and_late_reply_discarded() {
        let table = OperationTable::new(vec![table::OperationDescriptor::new(
            OpKind::CmStatus,
            NodeKind::Cm,
            1000,
            ping,
        )]);
        let mut h = Harness::new(table, settings());

        h.tick();
        assert_eq!(h.unit().state(), UnitState::Busy);

        // Inside timeout + grace: still waiting
        h.advance(2500);
        h.tick();
        assert_eq!(h.unit().state(), UnitState::Busy);

        h.advance(600);
        h.tick();
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::CmStatus), Status::Fail);
        // Next round started straight away since the op was long due
        assert_eq!(h.sent_count(), 2);

        // The first exchange finally answers; it must not resolve the second
        h.respond_ok(&[]);
        assert_eq!(h.unit().state(), UnitState::Busy);
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::CmStatus), Status::Fail);

        h.respond_ok(&[]);
        assert_eq!(h.unit().state(), UnitState::Idle);
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::CmStatus), Status::Success);
    }

    #[test]
    fn test_write_retry_is_bounded() {
        let table = OperationTable::new(vec![table::OperationDescriptor::new(
            OpKind::ProcessActions,
            NodeKind::Cm,
            1000,
            crate::ops::actions::issue_process_actions,
        )
        .on_complete(crate::ops::actions::complete_process_actions)]);
        let mut h = Harness::new(table, settings());
        h.bring_online();
        let now = h.now;
        h.scheduler.submit(
            ActionRequest {
                cm: 1,
                action: Action::SetPsuState { slot: 2, enabled: true },
            },
            now,
        );

        h.tick();
        for _ in 0..5 {
            h.respond(Ok(Response::error(0xd5)));
        }

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 5);
        let expected = Request::pmbus_write_byte(2, PMBUS_OPERATION, 0x80);
        assert!(sent.iter().all(|(_, request)| *request == expected));
        let generations: Vec<u64> = sent.iter().map(|(tag, _)| tag.generation).collect();
        assert_eq!(generations, vec![1, 2, 3, 4, 5]);

        assert_eq!(h.unit().state(), UnitState::Idle);
        assert_eq!(h.unit().pending_actions(), 0);
        assert_eq!(h.unit().tree().psu_group().slots[1].enabled, None);
    }

    #[test]
    fn test_write_retry_stops_on_success() {
        let table = OperationTable::new(vec![table::OperationDescriptor::new(
            OpKind::ProcessActions,
            NodeKind::Cm,
            1000,
            crate::ops::actions::issue_process_actions,
        )
        .on_complete(crate::ops::actions::complete_process_actions)]);
        let mut h = Harness::new(table, settings());
        h.bring_online();
        let now = h.now;
        h.scheduler.submit(
            ActionRequest {
                cm: 1,
                action: Action::SetPsuState { slot: 1, enabled: false },
            },
            now,
        );

        h.tick();
        h.respond(Ok(Response::error(0xc0)));
        h.respond_ok(&[]);

        assert_eq!(h.sent_count(), 2);
        assert_eq!(h.unit().tree().psu_group().slots[0].enabled, Some(false));
    }

    #[test]
    fn test_zone_pwm_action_rearms_operation() {
        let mut h = Harness::new(OperationTable::standard(Platform::Standard), settings());
        h.bring_online();
        h.tree_mut()
            .condition_mut(NodeKind::ThermalZone, OpKind::ZonePwm)
            .expect("condition")
            .next_eligible_at = Some(h.now + Duration::from_secs(60));

        let now = h.now;
        assert!(h.scheduler.submit(ActionRequest { cm: 1, action: Action::SetZonePwm { pwm: 40 } }, now));
        assert!(!h.scheduler.submit(ActionRequest { cm: 9, action: Action::SetZonePwm { pwm: 40 } }, now));

        assert_eq!(h.unit().tree().thermal_zone().pwm_pending, Some(40));
        assert_eq!(
            h.unit().tree().condition(NodeKind::ThermalZone, OpKind::ZonePwm).and_then(|c| c.next_eligible_at),
            None
        );
        assert_eq!(h.unit().wake_at(), Some(now));
    }

    #[test]
    fn test_once_operation_reruns_after_cm_offline() {
        use crate::ops::cm;
        use crate::store::EventKind;

        const SAMPLE: [u8; 5] = [0x20, 0x01, 0x03, 0x45, 0x02];
        let table = OperationTable::new(vec![
            table::OperationDescriptor::new(OpKind::DeviceId, NodeKind::Cm, 1000, cm::issue_device_id)
                .on_complete(cm::complete_device_id)
                .once(),
            table::OperationDescriptor::new(OpKind::CmStatus, NodeKind::Cm, 1000, cm::issue_cm_status)
                .on_complete(cm::complete_cm_status),
        ]);
        let mut h = Harness::new(table, settings());

        h.tick();
        h.respond_ok(&SAMPLE);
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::DeviceId), Status::Success);

        // Three liveness failures in a row, one per round
        h.respond(Ok(Response::error(0xc3)));
        for _ in 0..2 {
            h.advance(1000);
            h.tick();
            h.respond(Ok(Response::error(0xc3)));
        }
        assert_eq!(h.sent_count(), 4);
        assert!(!h.unit().tree().is_online(NodeKind::Cm));
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::DeviceId), Status::Unset);

        h.advance(1000);
        h.tick();
        assert_eq!(h.sent_count(), 5);
        assert_eq!(h.last_request(), Request::new(crate::protocol::NETFN_APP, crate::protocol::CMD_GET_DEVICE_ID));

        h.respond_ok(&SAMPLE);
        assert_eq!(h.unit().tree().status(NodeKind::Cm, OpKind::DeviceId), Status::Success);
        assert!(h.unit().tree().is_online(NodeKind::Cm));

        let events = h.store.events();
        let added = events.iter().filter(|e| matches!(e, EventKind::CmAdded { .. })).count();
        let removed = events.iter().filter(|e| matches!(e, EventKind::CmRemoved { .. })).count();
        assert_eq!((added, removed), (2, 1));
    }

    #[test]
    fn test_submit_rejects_invalid_action() {
        let mut h = Harness::new(OperationTable::standard(Platform::Standard), settings());
        let now = h.now;

        for action in [
            Action::SetPsuState { slot: 7, enabled: true },
            Action::SetPsuState { slot: 0, enabled: false },
            Action::SoftResetDrawer { drawer: 5 },
            Action::SetRackPuid { puid: 0 },
        ] {
            assert!(!h.scheduler.submit(ActionRequest { cm: 1, action }, now));
        }
        assert!(!h.scheduler.submit(ActionRequest { cm: 1, action: Action::SetZonePwm { pwm: 101 } }, now));

        assert_eq!(h.unit().pending_actions(), 0);
        assert_eq!(h.unit().tree().thermal_zone().pwm_pending, None);
        assert_eq!(h.scheduler.settings.rack_puid, 0);
    }

    #[test]
    fn test_rack_puid_rearms_push() {
        let mut h = Harness::new(OperationTable::standard(Platform::BdcR), settings());
        h.bring_online();
        h.tree_mut()
            .condition_mut(NodeKind::DrawerGroup, OpKind::DrawerRackPuidPush)
            .expect("condition")
            .next_eligible_at = Some(h.now + Duration::from_secs(60));

        let now = h.now;
        assert!(h.scheduler.submit(ActionRequest { cm: 1, action: Action::SetRackPuid { puid: 0x1234 } }, now));

        assert_eq!(h.scheduler.settings.rack_puid, 0x1234);
        assert_eq!(h.unit().pending_actions(), 0);
        assert_eq!(
            h.unit()
                .tree()
                .condition(NodeKind::DrawerGroup, OpKind::DrawerRackPuidPush)
                .and_then(|c| c.next_eligible_at),
            None
        );
        assert_eq!(h.unit().wake_at(), Some(now));
    }

    #[test]
    fn test_gate_order() {
        let table = OperationTable::standard(Platform::Standard);
        let mut tree = Tree::new(&table);
        let now = Instant::now();
        let pz = tree.lookup(NodeKind::PowerZone);
        let later = Condition {
            next_eligible_at: Some(now + Duration::from_secs(1)),
            ..Condition::default()
        };

        assert_eq!(gate(&tree, pz, &later, false, now), Gate::Blocked { until: None });

        let root = tree.root();
        tree.set_liveness(root, Liveness::Online, false);
        assert_eq!(
            gate(&tree, pz, &later, false, now),
            Gate::Blocked { until: Some(now + Duration::from_secs(1)) }
        );

        let succeeded = Condition {
            status: Status::Success,
            ..Condition::default()
        };
        assert_eq!(gate(&tree, pz, &succeeded, true, now), Gate::Blocked { until: None });
        assert_eq!(gate(&tree, pz, &succeeded, false, now), Gate::Ready);
        assert_eq!(gate(&tree, pz, &Condition::default(), false, now), Gate::Ready);
    }
}
