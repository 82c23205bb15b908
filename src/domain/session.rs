use crate::domain::models::{
    CountdownBaseline, FsmState, PomodoroSession, SessionUpdate, TaskId, TaskRef,
};
use chrono::{DateTime, Utc};

/// What a reconciliation step did to the displayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Applied,
    /// Termination observed for the first time.
    Terminated,
    StaleTask,
    AlreadyTerminated,
}

impl Reconciled {
    pub fn changed_state(self) -> bool {
        matches!(self, Self::Applied | Self::Terminated)
    }
}

/// Reconciled session state for the one task a view is displaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedSession {
    task: TaskRef,
    default_total_seconds: u32,
    session: Option<PomodoroSession>,
}

impl DisplayedSession {
    pub fn new(task: TaskRef, focus_minutes: u32) -> Self {
        let default_total_seconds = task.default_duration_seconds(focus_minutes);
        Self {
            task,
            default_total_seconds,
            session: None,
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn session(&self) -> Option<&PomodoroSession> {
        self.session.as_ref()
    }

    pub fn fsm_state(&self) -> FsmState {
        self.session
            .as_ref()
            .map_or(FsmState::Idle, |session| session.fsm_state)
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.default_total_seconds, |session| session.remaining_seconds)
    }

    pub fn total_duration_seconds(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.default_total_seconds, |session| session.total_duration_seconds)
    }

    pub fn is_terminated(&self) -> bool {
        self.fsm_state() == FsmState::Terminated
    }

    pub fn accepts(&self, task_id: Option<&TaskId>) -> bool {
        task_id == Some(&self.task.id)
    }

    /// Routes an update to `apply_update` or `apply_termination` after the
    /// task-identity filter.
    pub fn reconcile(&mut self, update: &SessionUpdate) -> Reconciled {
        if !self.accepts(update.task_id.as_ref()) {
            return Reconciled::StaleTask;
        }
        if update.is_termination() {
            return self.apply_termination();
        }
        self.apply_update(update)
    }

    pub fn apply_update(&mut self, update: &SessionUpdate) -> Reconciled {
        if !self.accepts(update.task_id.as_ref()) {
            return Reconciled::StaleTask;
        }
        if self.is_terminated() {
            return Reconciled::AlreadyTerminated;
        }
        if update.fsm_state == FsmState::Terminated {
            return self.apply_termination();
        }

        let default_total_seconds = self.default_total_seconds;
        let task_id = self.task.id.clone();
        let session = self
            .session
            .get_or_insert_with(|| PomodoroSession::idle(task_id, default_total_seconds));

        session.fsm_state = update.fsm_state;
        if let Some(remaining) = update.remaining_seconds {
            session.remaining_seconds = remaining;
        }
        if let Some(total) = update.total_duration_seconds {
            session.total_duration_seconds = total;
        }
        if let Some(paused) = update.paused_seconds {
            session.paused_seconds = paused;
        }
        if update.started_at.is_some() {
            session.started_at = update.started_at;
        }
        Reconciled::Applied
    }

    pub fn apply_termination(&mut self) -> Reconciled {
        if self.is_terminated() {
            return Reconciled::AlreadyTerminated;
        }

        let default_total_seconds = self.default_total_seconds;
        let task_id = self.task.id.clone();
        let session = self
            .session
            .get_or_insert_with(|| PomodoroSession::idle(task_id, default_total_seconds));
        session.fsm_state = FsmState::Terminated;
        session.remaining_seconds = 0;
        Reconciled::Terminated
    }

    /// Drops a terminated session so the next update starts a fresh one.
    pub fn acknowledge_termination(&mut self) -> bool {
        if !self.is_terminated() {
            return false;
        }
        self.session = None;
        true
    }

    /// The server reported no active session. A terminated session stays
    /// until it is acknowledged.
    pub fn clear(&mut self) -> bool {
        if self.session.is_none() || self.is_terminated() {
            return false;
        }
        self.session = None;
        true
    }

    pub fn baseline(&self, now: DateTime<Utc>) -> CountdownBaseline {
        CountdownBaseline {
            fsm_state: self.fsm_state(),
            remaining_seconds: self.remaining_seconds(),
            total_duration_seconds: self.total_duration_seconds(),
            last_synced_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn displayed(task_id: &str) -> DisplayedSession {
        DisplayedSession::new(TaskRef::new(task_id), 25)
    }

    fn arb_state() -> impl Strategy<Value = FsmState> {
        prop::sample::select(FsmState::ALL.to_vec())
    }

    fn arb_update(task_id: &'static str) -> impl Strategy<Value = SessionUpdate> {
        (
            arb_state(),
            prop::option::of(0u32..7200),
            prop::option::of(0u32..7200),
            any::<bool>(),
        )
            .prop_map(move |(state, remaining, total, ended)| {
                let mut update = SessionUpdate::new(task_id, state);
                update.remaining_seconds = remaining;
                update.total_duration_seconds = total;
                update.ended = ended;
                update
            })
    }

    #[test]
    fn absent_session_is_idle_with_default_duration() {
        let view = DisplayedSession::new(TaskRef::new("a").with_estimate(2), 25);
        assert_eq!(view.fsm_state(), FsmState::Idle);
        assert_eq!(view.remaining_seconds(), 3000);
        assert_eq!(view.total_duration_seconds(), 3000);
        assert!(view.session().is_none());
    }

    #[test]
    fn update_rebaselines_without_interpolation() {
        let mut view = displayed("a");
        let focus = SessionUpdate::new("a", FsmState::FocusRunning)
            .with_remaining(1500)
            .with_total(1500);
        assert_eq!(view.reconcile(&focus), Reconciled::Applied);
        assert_eq!(view.remaining_seconds(), 1500);

        let rest = SessionUpdate::new("a", FsmState::BreakRunning).with_remaining(300);
        assert_eq!(view.reconcile(&rest), Reconciled::Applied);
        assert_eq!(view.fsm_state(), FsmState::BreakRunning);
        assert_eq!(view.remaining_seconds(), 300);
        assert_eq!(view.total_duration_seconds(), 1500);
    }

    #[test]
    fn update_without_seconds_only_moves_state() {
        let mut view = displayed("a");
        view.reconcile(
            &SessionUpdate::new("a", FsmState::FocusRunning)
                .with_remaining(900)
                .with_total(1500),
        );
        view.reconcile(&SessionUpdate::new("a", FsmState::FocusPaused));
        assert_eq!(view.fsm_state(), FsmState::FocusPaused);
        assert_eq!(view.remaining_seconds(), 900);
    }

    #[test]
    fn ended_flag_terminates_regardless_of_state() {
        let mut view = displayed("a");
        let mut update = SessionUpdate::new("a", FsmState::FocusRunning).with_remaining(600);
        update.ended = true;
        assert_eq!(view.reconcile(&update), Reconciled::Terminated);
        assert_eq!(view.fsm_state(), FsmState::Terminated);
        assert_eq!(view.remaining_seconds(), 0);
        assert_eq!(view.apply_termination(), Reconciled::AlreadyTerminated);
    }

    #[test]
    fn acknowledged_termination_allows_a_new_session() {
        let mut view = displayed("a");
        view.apply_termination();
        assert_eq!(
            view.reconcile(&SessionUpdate::new("a", FsmState::FocusRunning)),
            Reconciled::AlreadyTerminated
        );

        assert!(view.acknowledge_termination());
        assert_eq!(view.fsm_state(), FsmState::Idle);
        assert_eq!(
            view.reconcile(&SessionUpdate::new("a", FsmState::FocusRunning).with_remaining(1500)),
            Reconciled::Applied
        );
        assert_eq!(view.fsm_state(), FsmState::FocusRunning);
    }

    #[test]
    fn clear_returns_to_default_but_keeps_termination() {
        let mut view = displayed("a");
        view.reconcile(&SessionUpdate::new("a", FsmState::FocusPaused).with_remaining(42));
        assert!(view.clear());
        assert_eq!(view.fsm_state(), FsmState::Idle);
        assert_eq!(view.remaining_seconds(), 1500);

        view.apply_termination();
        assert!(!view.clear());
        assert!(view.is_terminated());
    }

    #[test]
    fn update_without_task_is_dropped() {
        let mut view = displayed("a");
        let mut update = SessionUpdate::new("a", FsmState::FocusRunning);
        update.task_id = None;
        assert_eq!(view.reconcile(&update), Reconciled::StaleTask);
        assert!(view.session().is_none());
    }

    proptest! {
        #[test]
        fn terminated_session_absorbs_every_later_update(
            updates in prop::collection::vec(arb_update("a"), 0..24)
        ) {
            let mut view = displayed("a");
            view.reconcile(&SessionUpdate::new("a", FsmState::FocusRunning).with_remaining(1200));
            prop_assert_eq!(view.apply_termination(), Reconciled::Terminated);

            for update in &updates {
                prop_assert_eq!(view.reconcile(update), Reconciled::AlreadyTerminated);
                prop_assert_eq!(view.fsm_state(), FsmState::Terminated);
                prop_assert_eq!(view.remaining_seconds(), 0);
            }
        }

        #[test]
        fn updates_for_other_tasks_never_touch_displayed_state(
            setup in arb_update("a"),
            foreign in prop::collection::vec(arb_update("b"), 1..24)
        ) {
            let mut view = displayed("a");
            view.reconcile(&setup);
            let before = view.clone();

            for update in &foreign {
                prop_assert_eq!(view.reconcile(update), Reconciled::StaleTask);
            }
            prop_assert_eq!(view, before);
        }
    }
}
