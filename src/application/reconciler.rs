use crate::application::api::SessionApi;
use crate::domain::models::{
    CountdownBaseline, FsmState, PhaseChange, PomodoroSession, SessionAction, SessionUpdate,
    TaskId, TaskRef,
};
use crate::domain::session::{DisplayedSession, Reconciled};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
pub type SessionEndedCallback = Arc<dyn Fn(&TaskId) + Send + Sync>;

const PHASE_CAPACITY: usize = 16;

/// Owns the reconciled session for one displayed task. Every change is
/// republished as a countdown baseline, and every phase transition is
/// broadcast as it is applied.
pub struct SessionReconciler<A: SessionApi> {
    api: Arc<A>,
    focus_minutes: u32,
    displayed: Mutex<DisplayedSession>,
    baseline: watch::Sender<CountdownBaseline>,
    phases: broadcast::Sender<PhaseChange>,
    pending: AtomicBool,
    now_provider: NowProvider,
    on_session_ended: Option<SessionEndedCallback>,
}

impl<A: SessionApi> SessionReconciler<A> {
    pub fn new(api: Arc<A>, task: TaskRef, focus_minutes: u32) -> Self {
        let now_provider: NowProvider = Arc::new(Utc::now);
        let displayed = DisplayedSession::new(task, focus_minutes);
        let (baseline, _) = watch::channel(displayed.baseline(now_provider()));
        let (phases, _) = broadcast::channel(PHASE_CAPACITY);
        Self {
            api,
            focus_minutes,
            displayed: Mutex::new(displayed),
            baseline,
            phases,
            pending: AtomicBool::new(false),
            now_provider,
            on_session_ended: None,
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self.publish();
        self
    }

    /// Invoked once each time termination is first observed.
    pub fn with_session_ended<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskId) + Send + Sync + 'static,
    {
        self.on_session_ended = Some(Arc::new(callback));
        self
    }

    pub fn subscribe_baseline(&self) -> watch::Receiver<CountdownBaseline> {
        self.baseline.subscribe()
    }

    pub fn subscribe_phases(&self) -> broadcast::Receiver<PhaseChange> {
        self.phases.subscribe()
    }

    pub fn baseline(&self) -> CountdownBaseline {
        *self.baseline.borrow()
    }

    pub fn snapshot(&self) -> DisplayedSession {
        self.displayed().clone()
    }

    pub fn task_id(&self) -> TaskId {
        self.displayed().task_id().clone()
    }

    pub fn fsm_state(&self) -> FsmState {
        self.displayed().fsm_state()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Fetches the current session for `task_id`. A result for a task that is
    /// no longer displayed is dropped.
    pub async fn hydrate(&self, task_id: &TaskId) -> Result<Option<PomodoroSession>, InfraError> {
        let fetched = self.api.get_active_session(Some(task_id)).await?;

        let Some(mut update) = fetched else {
            let cleared = {
                let mut displayed = self.displayed();
                displayed.accepts(Some(task_id)) && displayed.clear()
            };
            if cleared {
                self.publish();
            }
            return Ok(None);
        };

        update.task_id.get_or_insert_with(|| task_id.clone());
        if update.remaining_seconds.is_none() {
            update.remaining_seconds = self.derived_remaining(&update);
        }

        let (transition, session) = {
            let mut displayed = self.displayed();
            if !displayed.accepts(update.task_id.as_ref()) {
                tracing::debug!(%task_id, "dropping hydration for a task no longer displayed");
                return Ok(None);
            }
            let transition =
                Transition::capture(&mut displayed, |session| session.reconcile(&update));
            (transition, displayed.session().cloned())
        };
        self.after(transition);
        Ok(session)
    }

    pub fn apply_update(&self, update: &SessionUpdate) -> Reconciled {
        let transition =
            Transition::capture(&mut self.displayed(), |session| session.apply_update(update));
        self.after(transition)
    }

    pub fn apply_termination(&self) -> Reconciled {
        let transition =
            Transition::capture(&mut self.displayed(), DisplayedSession::apply_termination);
        self.after(transition)
    }

    /// Entry point for push messages: termination frames go through
    /// `apply_termination`, everything else through `apply_update`.
    pub fn handle_push(&self, update: &SessionUpdate) -> Reconciled {
        let transition =
            Transition::capture(&mut self.displayed(), |session| session.reconcile(update));
        if transition.outcome == Reconciled::StaleTask {
            tracing::debug!(task_id = ?update.task_id, "ignoring push update for another task");
        }
        self.after(transition)
    }

    /// Switches to another task; the previous session is discarded.
    pub fn select_task(&self, task: TaskRef) {
        *self.displayed() = DisplayedSession::new(task, self.focus_minutes);
        self.publish();
    }

    pub fn acknowledge_termination(&self) -> bool {
        let acknowledged = self.displayed().acknowledge_termination();
        if acknowledged {
            self.publish();
        }
        acknowledged
    }

    pub async fn start(&self) -> Result<(), InfraError> {
        self.dispatch(SessionAction::Start).await
    }

    pub async fn pause(&self) -> Result<(), InfraError> {
        self.dispatch(SessionAction::Pause).await
    }

    pub async fn resume(&self) -> Result<(), InfraError> {
        self.dispatch(SessionAction::Resume).await
    }

    pub async fn complete(&self) -> Result<(), InfraError> {
        self.dispatch(SessionAction::Complete).await
    }

    /// Sends one action. Rejected locally while another is outstanding.
    /// Displayed state is left for the server's push to update.
    pub async fn dispatch(&self, action: SessionAction) -> Result<(), InfraError> {
        if self
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(InfraError::ActionPending);
        }
        let _pending = PendingGuard(&self.pending);

        let task_id = self.task_id();
        tracing::debug!(%task_id, %action, "sending session action");
        self.api.send_action(&task_id, action).await
    }

    fn derived_remaining(&self, update: &SessionUpdate) -> Option<u32> {
        let total = update.total_duration_seconds?;
        let started_at = update.started_at?;
        Some(PomodoroSession::derive_remaining(
            total,
            started_at,
            update.paused_seconds.unwrap_or(0),
            (self.now_provider)(),
        ))
    }

    fn after(&self, transition: Transition) -> Reconciled {
        let Transition {
            outcome,
            task_id,
            previous,
            next,
        } = transition;
        if outcome.changed_state() {
            self.publish();
        }
        if let Some(change) = PhaseChange::between(previous, next) {
            tracing::debug!(?change, %task_id, "session phase changed");
            let _ = self.phases.send(change);
        }
        if outcome == Reconciled::Terminated {
            tracing::info!(%task_id, "session ended");
            if let Some(callback) = &self.on_session_ended {
                callback(&task_id);
            }
        }
        outcome
    }

    fn publish(&self) {
        let baseline = self.displayed().baseline((self.now_provider)());
        self.baseline.send_replace(baseline);
    }

    fn displayed(&self) -> MutexGuard<'_, DisplayedSession> {
        self.displayed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One reconciliation, recorded while the session lock is held.
struct Transition {
    outcome: Reconciled,
    task_id: TaskId,
    previous: FsmState,
    next: FsmState,
}

impl Transition {
    fn capture(
        displayed: &mut DisplayedSession,
        reconcile: impl FnOnce(&mut DisplayedSession) -> Reconciled,
    ) -> Self {
        let previous = displayed.fsm_state();
        let outcome = reconcile(displayed);
        Self {
            outcome,
            task_id: displayed.task_id().clone(),
            previous,
            next: displayed.fsm_state(),
        }
    }
}

struct PendingGuard<'a>(&'a AtomicBool);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
