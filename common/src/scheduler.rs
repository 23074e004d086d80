//! Per-valve task scheduler.
//!
//! Only one radio conversation may be in flight per valve. Every operation is
//! queued as a [`Task`] and run through an explicit link state machine:
//!
//! ```text
//! Idle -> Connecting -> Writing -> AwaitingNotify -> Disconnecting -> Idle
//! ```
//!
//! Transitions are driven by [`RadioEvent`](crate::radio::RadioEvent)s routed
//! in through the `on_*` methods and by [`Thermostat::tick`], which fires the
//! failsafe and auto-refresh timers. Nothing here performs I/O; every method
//! returns the [`ThermostatAction`]s the caller must execute.

use std::collections::VecDeque;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::{
    config::SchedulerTiming,
    eq3::{clamp_offset, decode_status, quantize_temperature, Command, TaskKind},
    error::CodecError,
    radio::RadioAction,
    types::{ConfigUpdate, DeviceConfig, ThermostatState, ValveMode},
};

pub type TaskId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub command: Command,
    bytes: Vec<u8>,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.command.kind()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Connecting,
    Writing,
    AwaitingNotify,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    Write(String),
    Decode(CodecError),
    /// A newer task of the same kind replaced this one before it ran.
    Superseded,
    Killed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThermostatAction {
    Radio(RadioAction),
    Completed {
        id: TaskId,
        kind: TaskKind,
        result: Result<(), TaskError>,
    },
    /// Retry budget exhausted; the valve takes no further work.
    Killed,
}

#[derive(Debug, Clone)]
struct InFlight {
    task: Task,
    outcome: Option<Result<(), TaskError>>,
}

#[derive(Debug, Clone)]
pub struct Thermostat {
    address: String,
    timing: SchedulerTiming,
    config: Option<DeviceConfig>,
    state: ThermostatState,
    last_readout_ms: Option<u64>,

    queue: VecDeque<Task>,
    current: Option<InFlight>,
    phase: LinkPhase,
    next_task_id: TaskId,

    failsafe_deadline_ms: Option<u64>,
    failures: u32,
    killed: bool,

    refreshing: bool,
    refresh_due_ms: Option<u64>,
    next_auto_refresh_ms: u64,
}

impl Thermostat {
    pub fn new(address: impl Into<String>, timing: SchedulerTiming) -> Self {
        let next_auto_refresh_ms = timing.refresh_interval_ms;
        Self {
            address: address.into(),
            timing,
            config: None,
            state: ThermostatState::default(),
            last_readout_ms: None,
            queue: VecDeque::new(),
            current: None,
            phase: LinkPhase::Idle,
            next_task_id: 1,
            failsafe_deadline_ms: None,
            failures: 0,
            killed: false,
            refreshing: false,
            refresh_due_ms: None,
            next_auto_refresh_ms,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> Option<DeviceConfig> {
        self.config
    }

    pub fn state(&self) -> ThermostatState {
        self.state
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn last_readout_ms(&self) -> Option<u64> {
        self.last_readout_ms
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.as_ref().map(|inflight| &inflight.task)
    }

    pub fn queued(&self) -> impl Iterator<Item = &Task> {
        self.queue.iter()
    }

    pub fn next_auto_refresh_ms(&self) -> u64 {
        self.next_auto_refresh_ms
    }

    pub fn refresh_due_ms(&self) -> Option<u64> {
        self.refresh_due_ms
    }

    /// True once a readout exists and is older than the activity window.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.last_readout_ms
            .is_some_and(|last| now_ms.saturating_sub(last) > self.timing.activity_window_ms)
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        match (self.failsafe_deadline_ms, self.refresh_due_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn enqueue(&mut self, command: Command, now_ms: u64) -> (TaskId, Vec<ThermostatAction>) {
        let mut actions = Vec::new();
        let id = self.push_task(command, now_ms, &mut actions);
        (id, actions)
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        let mut actions = Vec::new();
        if self.killed {
            return actions;
        }

        if self
            .failsafe_deadline_ms
            .is_some_and(|deadline| now_ms >= deadline)
        {
            self.fire_failsafe(now_ms, &mut actions);
            if self.killed {
                return actions;
            }
        }

        if self.refresh_due_ms.is_some_and(|due| now_ms >= due) {
            self.refresh_due_ms = None;
            self.refresh(now_ms, &mut actions);
        }

        actions
    }

    /// Queues a status readout unless one is already pending.
    pub fn refresh_data(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        let mut actions = Vec::new();
        self.refresh(now_ms, &mut actions);
        actions
    }

    /// Applies `update` to the valve. The first call performs the full attach
    /// sequence; later calls only push fields whose value changed.
    pub fn reset_config(
        &mut self,
        update: ConfigUpdate,
        wall_clock: NaiveDateTime,
        now_ms: u64,
    ) -> Vec<ThermostatAction> {
        let mut actions = Vec::new();

        let Some(mut current) = self.config else {
            let mut config = update.resolve();
            config.offset = clamp_offset(config.offset);
            self.config = Some(config);

            self.push_task(Command::SetTime(wall_clock), now_ms, &mut actions);
            self.push_task(Command::Offset(config.offset), now_ms, &mut actions);
            self.push_task(Command::Lock(config.lock), now_ms, &mut actions);
            self.push_task(Command::Mode(ValveMode::Manual), now_ms, &mut actions);
            self.refresh(now_ms, &mut actions);
            return actions;
        };

        if let Some(offset) = update.offset.map(clamp_offset) {
            if (offset - current.offset).abs() > f32::EPSILON {
                current.offset = offset;
                self.push_task(Command::Offset(offset), now_ms, &mut actions);
            }
        }
        if let Some(lock) = update.lock {
            if lock != current.lock {
                current.lock = lock;
                self.push_task(Command::Lock(lock), now_ms, &mut actions);
            }
        }
        self.config = Some(current);

        actions
    }

    /// Sets the target temperature. The value written to the valve, clamped
    /// and rounded to half a degree, is reflected in [`state`](Self::state)
    /// immediately, before the valve confirms it.
    pub fn set_temperature(&mut self, temp: f32, now_ms: u64) -> Vec<ThermostatAction> {
        let target = quantize_temperature(temp);
        self.state.target_temperature = target;
        self.enqueue(Command::Temperature(target), now_ms).1
    }

    pub fn set_offset(&mut self, offset: f32, now_ms: u64) -> Vec<ThermostatAction> {
        self.enqueue(Command::Offset(clamp_offset(offset)), now_ms).1
    }

    pub fn set_lock(&mut self, lock: bool, now_ms: u64) -> Vec<ThermostatAction> {
        self.enqueue(Command::Lock(lock), now_ms).1
    }

    pub fn set_mode(&mut self, mode: ValveMode, now_ms: u64) -> Vec<ThermostatAction> {
        self.enqueue(Command::Mode(mode), now_ms).1
    }

    pub fn set_manual_mode(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        self.set_mode(ValveMode::Manual, now_ms)
    }

    pub fn set_auto_mode(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        self.set_mode(ValveMode::Auto, now_ms)
    }

    pub fn set_eco_mode(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        self.set_mode(ValveMode::Eco, now_ms)
    }

    pub fn set_boost(&mut self, on: bool, now_ms: u64) -> Vec<ThermostatAction> {
        self.enqueue(Command::Boost(on), now_ms).1
    }

    pub fn set_comfort(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        self.enqueue(Command::Comfort, now_ms).1
    }

    pub fn set_eco(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        self.enqueue(Command::Eco, now_ms).1
    }

    pub fn set_temperature_preset(
        &mut self,
        comfort: f32,
        eco: f32,
        now_ms: u64,
    ) -> Vec<ThermostatAction> {
        self.enqueue(Command::TemperaturePreset { comfort, eco }, now_ms)
            .1
    }

    pub fn set_open_window(
        &mut self,
        temp: f32,
        duration_minutes: u32,
        now_ms: u64,
    ) -> Vec<ThermostatAction> {
        self.enqueue(
            Command::OpenWindow {
                temp,
                duration_minutes,
            },
            now_ms,
        )
        .1
    }

    pub fn set_date(&mut self, wall_clock: NaiveDateTime, now_ms: u64) -> Vec<ThermostatAction> {
        self.enqueue(Command::SetTime(wall_clock), now_ms).1
    }

    pub fn on_connected(&mut self, _now_ms: u64) -> Vec<ThermostatAction> {
        if self.phase != LinkPhase::Connecting {
            debug!(address = %self.address, phase = ?self.phase, "ignoring stray connect");
            return Vec::new();
        }
        let Some(inflight) = &self.current else {
            self.phase = LinkPhase::Idle;
            return Vec::new();
        };

        self.phase = LinkPhase::Writing;
        vec![ThermostatAction::Radio(RadioAction::Write(
            inflight.task.bytes.clone(),
        ))]
    }

    pub fn on_write_complete(
        &mut self,
        result: Result<(), String>,
        _now_ms: u64,
    ) -> Vec<ThermostatAction> {
        if self.phase != LinkPhase::Writing {
            debug!(address = %self.address, phase = ?self.phase, "ignoring stray write completion");
            return Vec::new();
        }

        match result {
            Ok(()) => {
                self.phase = LinkPhase::AwaitingNotify;
                Vec::new()
            }
            Err(err) => {
                warn!(address = %self.address, "control write failed: {err}");
                self.begin_disconnect(Err(TaskError::Write(err)))
            }
        }
    }

    pub fn on_notify(&mut self, value: &[u8], now_ms: u64) -> Vec<ThermostatAction> {
        // Some stacks deliver the notification before the write callback.
        if !matches!(self.phase, LinkPhase::Writing | LinkPhase::AwaitingNotify) {
            debug!(address = %self.address, phase = ?self.phase, "ignoring stray notify");
            return Vec::new();
        }

        self.failures = 0;
        let outcome = match decode_status(value) {
            Ok(state) => {
                self.state = state;
                self.last_readout_ms = Some(now_ms);
                debug!(address = %self.address, ?state, "status readout");
                Ok(())
            }
            Err(err) => {
                warn!(address = %self.address, "undecodable notify: {err}");
                Err(TaskError::Decode(err))
            }
        };
        self.begin_disconnect(outcome)
    }

    pub fn on_disconnected(&mut self, now_ms: u64) -> Vec<ThermostatAction> {
        if self.phase != LinkPhase::Disconnecting {
            debug!(address = %self.address, phase = ?self.phase, "ignoring stray disconnect");
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.phase = LinkPhase::Idle;
        self.failsafe_deadline_ms = None;
        if let Some(inflight) = self.current.take() {
            let result = inflight
                .outcome
                .unwrap_or(Err(TaskError::Write("link closed".to_string())));
            self.finish(inflight.task, result, now_ms, &mut actions);
        }
        self.run_next(now_ms, &mut actions);
        actions
    }

    fn begin_disconnect(&mut self, outcome: Result<(), TaskError>) -> Vec<ThermostatAction> {
        if let Some(inflight) = self.current.as_mut() {
            inflight.outcome = Some(outcome);
        }
        self.phase = LinkPhase::Disconnecting;
        vec![ThermostatAction::Radio(RadioAction::Disconnect)]
    }

    fn refresh(&mut self, now_ms: u64, actions: &mut Vec<ThermostatAction>) {
        if self.refreshing || self.killed {
            return;
        }
        self.refreshing = true;
        self.push_task(Command::Info, now_ms, actions);
    }

    fn push_task(
        &mut self,
        command: Command,
        now_ms: u64,
        actions: &mut Vec<ThermostatAction>,
    ) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;

        let kind = command.kind();
        let (superseded, kept): (VecDeque<Task>, VecDeque<Task>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|task| task.kind() == kind);
        self.queue = kept;
        for task in superseded {
            debug!(address = %self.address, kind = kind.as_str(), "dropping superseded task");
            self.finish(task, Err(TaskError::Superseded), now_ms, actions);
        }

        if self.killed {
            self.finish(
                Task {
                    id,
                    bytes: command.encode(),
                    command,
                },
                Err(TaskError::Killed),
                now_ms,
                actions,
            );
            return id;
        }

        self.queue.push_back(Task {
            id,
            bytes: command.encode(),
            command,
        });
        self.run_next(now_ms, actions);
        id
    }

    fn run_next(&mut self, now_ms: u64, actions: &mut Vec<ThermostatAction>) {
        if self.killed || self.current.is_some() {
            return;
        }
        let Some(task) = self.queue.pop_front() else {
            return;
        };

        self.current = Some(InFlight {
            task,
            outcome: None,
        });
        self.phase = LinkPhase::Connecting;
        self.failsafe_deadline_ms = Some(now_ms + self.timing.failsafe_ms);
        actions.push(ThermostatAction::Radio(RadioAction::Connect));
    }

    fn fire_failsafe(&mut self, now_ms: u64, actions: &mut Vec<ThermostatAction>) {
        self.failsafe_deadline_ms = None;
        self.phase = LinkPhase::Idle;
        let inflight = self.current.take();
        actions.push(ThermostatAction::Radio(RadioAction::Disconnect));

        // Result already known, only the disconnect hung.
        if let Some(InFlight {
            task,
            outcome: Some(result),
        }) = inflight
        {
            self.finish(task, result, now_ms, actions);
            self.run_next(now_ms, actions);
            return;
        }

        self.failures += 1;
        if self.failures > self.timing.max_failures {
            self.kill(inflight, now_ms, actions);
            return;
        }

        if let Some(InFlight { task, .. }) = inflight {
            if self.queue.iter().any(|queued| queued.kind() == task.kind()) {
                self.finish(task, Err(TaskError::Superseded), now_ms, actions);
            } else {
                warn!(
                    address = %self.address,
                    kind = task.kind().as_str(),
                    failures = self.failures,
                    "radio operation timed out, retrying"
                );
                self.queue.push_front(task);
            }
        }

        self.run_next(now_ms, actions);
    }

    fn kill(
        &mut self,
        inflight: Option<InFlight>,
        now_ms: u64,
        actions: &mut Vec<ThermostatAction>,
    ) {
        warn!(
            address = %self.address,
            failures = self.failures,
            "retry budget exhausted, killing thermostat"
        );
        self.killed = true;
        self.refreshing = false;
        self.refresh_due_ms = None;

        if let Some(inflight) = inflight {
            self.finish(inflight.task, Err(TaskError::Killed), now_ms, actions);
        }
        for task in std::mem::take(&mut self.queue) {
            self.finish(task, Err(TaskError::Killed), now_ms, actions);
        }
        actions.push(ThermostatAction::Killed);
    }

    fn finish(
        &mut self,
        task: Task,
        result: Result<(), TaskError>,
        now_ms: u64,
        actions: &mut Vec<ThermostatAction>,
    ) {
        let kind = task.kind();
        let discarded = matches!(result, Err(TaskError::Superseded | TaskError::Killed));
        let ok = result.is_ok();
        actions.push(ThermostatAction::Completed {
            id: task.id,
            kind,
            result,
        });
        if discarded {
            return;
        }

        match kind {
            TaskKind::Info => {
                self.refreshing = false;
                if ok {
                    self.refresh_due_ms = Some(now_ms + self.next_auto_refresh_ms);
                    self.next_auto_refresh_ms = self.timing.refresh_interval_ms;
                } else {
                    self.refresh_due_ms = Some(now_ms + self.timing.refresh_retry_ms);
                }
            }
            TaskKind::Temperature => {
                self.next_auto_refresh_ms = self
                    .next_auto_refresh_ms
                    .min(self.timing.change_refresh_ms);
                self.refresh(now_ms, actions);
            }
            _ => {}
        }
    }
}
