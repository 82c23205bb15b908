use crate::application::api::SessionApi;
use crate::application::push_channel::{MessageSubscription, PushChannel};
use crate::application::reconciler::SessionReconciler;
use crate::application::ticker::CountdownTicker;
use crate::domain::models::{
    CountdownBaseline, FsmState, PhaseChange, PomodoroSession, SessionAction, format_clock,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::push_connector::PushConnector;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Timer for one displayed task: the reconciled session, its countdown and
/// its push subscription, all released together when dropped.
pub struct TaskTimer<A: SessionApi> {
    reconciler: Arc<SessionReconciler<A>>,
    ticker: CountdownTicker,
    subscription: Option<MessageSubscription>,
}

impl<A: SessionApi + 'static> TaskTimer<A> {
    pub fn mount(reconciler: Arc<SessionReconciler<A>>) -> Self {
        let ticker = CountdownTicker::spawn(reconciler.subscribe_baseline());
        Self {
            reconciler,
            ticker,
            subscription: None,
        }
    }

    /// Routes push messages from `channel` into this timer until it is
    /// dropped.
    pub fn attach<C: PushConnector + 'static>(mut self, channel: &PushChannel<C>) -> Self {
        let reconciler = Arc::downgrade(&self.reconciler);
        self.subscription = Some(channel.on_message(move |update| {
            if let Some(reconciler) = reconciler.upgrade() {
                reconciler.handle_push(update);
            }
        }));
        self
    }

    pub async fn hydrate(&self) -> Result<Option<PomodoroSession>, InfraError> {
        let task_id = self.reconciler.task_id();
        self.reconciler.hydrate(&task_id).await
    }

    /// The single start/pause/resume control. Returns the action sent, or
    /// `None` when the session is already terminated.
    pub async fn primary_action(&self) -> Result<Option<SessionAction>, InfraError> {
        let Some(action) = SessionAction::primary_for(self.fsm_state()) else {
            return Ok(None);
        };
        self.reconciler.dispatch(action).await?;
        Ok(Some(action))
    }

    pub async fn end_task(&self) -> Result<(), InfraError> {
        let state = self.fsm_state();
        if matches!(state, FsmState::Idle | FsmState::Terminated) {
            return Err(InfraError::InvalidAction {
                action: SessionAction::Complete.to_string(),
                state: state.to_string(),
            });
        }
        self.reconciler.complete().await
    }
}

impl<A: SessionApi> TaskTimer<A> {
    pub fn reconciler(&self) -> &Arc<SessionReconciler<A>> {
        &self.reconciler
    }

    pub fn fsm_state(&self) -> FsmState {
        self.reconciler.fsm_state()
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.ticker.remaining_seconds()
    }

    pub fn display(&self) -> String {
        format_clock(self.remaining_seconds())
    }

    pub fn progress(&self) -> f64 {
        CountdownBaseline {
            remaining_seconds: self.remaining_seconds(),
            ..self.reconciler.baseline()
        }
        .progress()
    }

    pub fn subscribe_remaining(&self) -> watch::Receiver<u32> {
        self.ticker.subscribe()
    }

    pub fn subscribe_phases(&self) -> broadcast::Receiver<PhaseChange> {
        self.reconciler.subscribe_phases()
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::push_channel::tests::{FakeConnector, settle};
    use crate::application::reconciler::tests::FakeSessionApi;
    use crate::domain::models::{SessionUpdate, TaskId, TaskRef};
    use std::time::Duration;

    fn timer(api: FakeSessionApi) -> (Arc<FakeSessionApi>, TaskTimer<FakeSessionApi>) {
        let api = Arc::new(api);
        let reconciler = SessionReconciler::new(Arc::clone(&api), TaskRef::new("7"), 25);
        (api, TaskTimer::mount(Arc::new(reconciler)))
    }

    #[tokio::test(start_paused = true)]
    async fn push_frames_drive_the_display() {
        let connector = Arc::new(FakeConnector::default());
        let channel = PushChannel::new(Arc::clone(&connector), "ws://test/ws/");
        let (_api, timer) = timer(FakeSessionApi::default());
        let timer = timer.attach(&channel);
        let mut phases = timer.subscribe_phases();
        assert_eq!(timer.display(), "25:00");

        channel.connect();
        settle().await;
        connector.push(
            r#"{"type":"SESSION_UPDATE","fsm_state":"FOCUS_RUNNING","task_id":7,
                "remaining_seconds":1500,"total_duration_seconds":1500}"#,
        );
        settle().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(timer.display(), "24:59");

        connector.push(r#"{"type":"SESSION_UPDATE","fsm_state":"BREAK_RUNNING","task_id":7,
                "remaining_seconds":300}"#);
        connector.push(r#"{"type":"SESSION_UPDATE","fsm_state":"IDLE","task_id":8}"#);
        settle().await;
        assert_eq!(timer.display(), "5:00");
        assert_eq!(timer.fsm_state(), FsmState::BreakRunning);
        assert!((timer.progress() - 0.2).abs() < f64::EPSILON);

        assert_eq!(phases.try_recv(), Ok(PhaseChange::FocusStarted));
        assert_eq!(phases.try_recv(), Ok(PhaseChange::BreakStarted));
    }

    #[tokio::test]
    async fn primary_action_follows_displayed_state() {
        let (api, timer) = timer(FakeSessionApi::default());

        assert_eq!(timer.primary_action().await, Ok(Some(SessionAction::Start)));
        timer
            .reconciler()
            .apply_update(&SessionUpdate::new("7", FsmState::FocusRunning));
        assert_eq!(timer.primary_action().await, Ok(Some(SessionAction::Pause)));
        timer
            .reconciler()
            .apply_update(&SessionUpdate::new("7", FsmState::BreakPaused));
        assert_eq!(timer.primary_action().await, Ok(Some(SessionAction::Resume)));
        timer.reconciler().apply_termination();
        assert_eq!(timer.primary_action().await, Ok(None));

        assert_eq!(
            api.sent_actions(),
            vec![SessionAction::Start, SessionAction::Pause, SessionAction::Resume]
        );
    }

    #[tokio::test]
    async fn end_task_is_rejected_while_idle() {
        let (api, timer) = timer(FakeSessionApi::default());

        let result = timer.end_task().await;

        assert_eq!(
            result,
            Err(InfraError::InvalidAction {
                action: "complete".to_string(),
                state: "IDLE".to_string(),
            })
        );
        assert!(api.sent_actions().is_empty());

        timer
            .reconciler()
            .apply_update(&SessionUpdate::new("7", FsmState::FocusPaused));
        timer.end_task().await.expect("complete");
        assert_eq!(api.sent_actions(), vec![SessionAction::Complete]);
    }

    #[tokio::test(start_paused = true)]
    async fn hydrate_uses_the_displayed_task() {
        let api = FakeSessionApi::with_active(
            SessionUpdate::new(TaskId::from(7), FsmState::FocusPaused).with_remaining(61),
        );
        let (_api, timer) = timer(api);

        timer.hydrate().await.expect("hydrate");
        settle().await;

        assert_eq!(timer.fsm_state(), FsmState::FocusPaused);
        assert_eq!(timer.display(), "1:01");
    }

    #[tokio::test]
    async fn dropping_the_timer_detaches_from_the_channel() {
        let connector = Arc::new(FakeConnector::default());
        let channel = PushChannel::new(Arc::clone(&connector), "ws://test/ws/");
        let (_api, timer) = timer(FakeSessionApi::default());
        let timer = timer.attach(&channel);
        assert!(timer.is_attached());
        assert_eq!(channel.handler_count(), 1);

        drop(timer);

        assert_eq!(channel.handler_count(), 0);
    }
}
