use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SESSION_UPDATE_KIND: &str = "SESSION_UPDATE";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawTaskId", into = "String")]
pub struct TaskId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTaskId {
    Number(i64),
    Text(String),
}

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RawTaskId> for TaskId {
    fn from(raw: RawTaskId) -> Self {
        match raw {
            RawTaskId::Number(value) => Self(value.to_string()),
            RawTaskId::Text(value) => Self::new(value),
        }
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    Idle,
    FocusRunning,
    FocusPaused,
    BreakRunning,
    BreakPaused,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Focus,
    Break,
}

impl FsmState {
    pub const ALL: [FsmState; 6] = [
        Self::Idle,
        Self::FocusRunning,
        Self::FocusPaused,
        Self::BreakRunning,
        Self::BreakPaused,
        Self::Terminated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::FocusRunning => "FOCUS_RUNNING",
            Self::FocusPaused => "FOCUS_PAUSED",
            Self::BreakRunning => "BREAK_RUNNING",
            Self::BreakPaused => "BREAK_PAUSED",
            Self::Terminated => "TERMINATED",
        }
    }

    pub fn phase(self) -> Option<Phase> {
        match self {
            Self::FocusRunning | Self::FocusPaused => Some(Phase::Focus),
            Self::BreakRunning | Self::BreakPaused => Some(Phase::Break),
            Self::Idle | Self::Terminated => None,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::FocusRunning | Self::BreakRunning)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, Self::FocusPaused | Self::BreakPaused)
    }

    /// Everything except `Idle` and `Terminated` keeps a countdown alive.
    /// Paused states count down too; the server does not, so the next
    /// baseline it reports replaces whatever was counted while paused.
    pub fn is_ticking(self) -> bool {
        self.phase().is_some()
    }
}

/// Phase transitions between two reconciled states, for collaborators that
/// react to them (sounds, notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseChange {
    FocusStarted,
    BreakStarted,
    Terminated,
}

impl PhaseChange {
    pub fn between(previous: FsmState, next: FsmState) -> Option<Self> {
        if next == FsmState::Terminated {
            return (previous != FsmState::Terminated).then_some(Self::Terminated);
        }
        match (previous.phase(), next.phase()) {
            (before, Some(Phase::Focus)) if before != Some(Phase::Focus) => {
                Some(Self::FocusStarted)
            }
            (before, Some(Phase::Break)) if before != Some(Phase::Break) => {
                Some(Self::BreakStarted)
            }
            _ => None,
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsmState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == value)
            .ok_or_else(|| format!("unknown fsm_state {value:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionAction {
    Start,
    Pause,
    Resume,
    Complete,
}

impl SessionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
        }
    }

    /// Action a single primary control issues for the given state.
    pub fn primary_for(state: FsmState) -> Option<Self> {
        match state {
            FsmState::Idle => Some(Self::Start),
            FsmState::FocusRunning | FsmState::BreakRunning => Some(Self::Pause),
            FsmState::FocusPaused | FsmState::BreakPaused => Some(Self::Resume),
            FsmState::Terminated => None,
        }
    }
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state as the remote service reports it, either in a push frame
/// or in an active-session response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub session_id: Option<i64>,
    pub task_id: Option<TaskId>,
    pub fsm_state: FsmState,
    pub remaining_seconds: Option<u32>,
    pub total_duration_seconds: Option<u32>,
    pub paused_seconds: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub is_break: Option<bool>,
    pub allowed_actions: Vec<String>,
    pub ended: bool,
}

impl SessionUpdate {
    pub fn new(task_id: impl Into<TaskId>, fsm_state: FsmState) -> Self {
        Self {
            session_id: None,
            task_id: Some(task_id.into()),
            fsm_state,
            remaining_seconds: None,
            total_duration_seconds: None,
            paused_seconds: None,
            started_at: None,
            is_break: None,
            allowed_actions: Vec::new(),
            ended: false,
        }
    }

    pub fn with_remaining(mut self, remaining_seconds: u32) -> Self {
        self.remaining_seconds = Some(remaining_seconds);
        self
    }

    pub fn with_total(mut self, total_duration_seconds: u32) -> Self {
        self.total_duration_seconds = Some(total_duration_seconds);
        self
    }

    pub fn is_termination(&self) -> bool {
        self.ended || self.fsm_state == FsmState::Terminated
    }
}

/// Loose wire shape shared by push frames and active-session responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionPayload {
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: Option<String>,
    #[serde(alias = "id", default)]
    pub session_id: Option<i64>,
    #[serde(default)]
    pub fsm_state: Option<String>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub remaining_seconds: Option<f64>,
    #[serde(default)]
    pub total_duration_seconds: Option<f64>,
    #[serde(default)]
    pub paused_seconds: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_break: Option<bool>,
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub ended: Option<bool>,
}

impl SessionPayload {
    pub fn is_session_update(&self) -> bool {
        self.kind.as_deref() == Some(SESSION_UPDATE_KIND)
    }

    /// `Ok(None)` when the payload carries no state at all (no active session).
    pub fn into_update(self) -> Result<Option<SessionUpdate>, String> {
        let Some(raw_state) = self.fsm_state else {
            return Ok(None);
        };
        let fsm_state = raw_state.trim().parse::<FsmState>()?;

        Ok(Some(SessionUpdate {
            session_id: self.session_id,
            task_id: self.task_id,
            fsm_state,
            remaining_seconds: self.remaining_seconds.map(whole_seconds),
            total_duration_seconds: self.total_duration_seconds.map(whole_seconds),
            paused_seconds: self.paused_seconds.map(whole_seconds),
            started_at: self.started_at,
            is_break: self.is_break,
            allowed_actions: self.allowed_actions,
            ended: self.ended.unwrap_or(false),
        }))
    }
}

fn whole_seconds(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.floor().min(f64::from(u32::MAX)) as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PomodoroSession {
    pub task_id: TaskId,
    pub fsm_state: FsmState,
    pub remaining_seconds: u32,
    pub total_duration_seconds: u32,
    pub paused_seconds: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl PomodoroSession {
    pub fn idle(task_id: TaskId, total_duration_seconds: u32) -> Self {
        Self {
            task_id,
            fsm_state: FsmState::Idle,
            remaining_seconds: total_duration_seconds,
            total_duration_seconds,
            paused_seconds: 0,
            started_at: None,
        }
    }

    /// Remaining time derived from the start instant when the server did not
    /// report it directly.
    pub fn derive_remaining(
        total_duration_seconds: u32,
        started_at: DateTime<Utc>,
        paused_seconds: u32,
        now: DateTime<Utc>,
    ) -> u32 {
        let elapsed = (now - started_at).num_seconds().max(0);
        let remaining =
            i64::from(total_duration_seconds) - elapsed - i64::from(paused_seconds);
        u32::try_from(remaining.max(0)).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.task_id.as_str().is_empty() {
            return Err("session.task_id must not be empty".to_string());
        }
        if self.fsm_state == FsmState::Terminated && self.remaining_seconds != 0 {
            return Err("session.remaining_seconds must be 0 once terminated".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub estimated_pomodoros: Option<u32>,
}

impl TaskRef {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            estimated_pomodoros: None,
        }
    }

    pub fn with_estimate(mut self, estimated_pomodoros: u32) -> Self {
        self.estimated_pomodoros = Some(estimated_pomodoros);
        self
    }

    /// Duration shown before any session exists for this task.
    pub fn default_duration_seconds(&self, focus_minutes: u32) -> u32 {
        let focus_seconds = focus_minutes.max(1).saturating_mul(60);
        match self.estimated_pomodoros.filter(|estimate| *estimate > 0) {
            Some(estimate) => estimate.saturating_mul(focus_seconds),
            None => focus_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PomodoroSettings {
    #[serde(default = "default_focus_minutes")]
    pub focus_minutes: u32,
    #[serde(default = "default_short_break_minutes")]
    pub short_break_minutes: u32,
    #[serde(default = "default_long_break_minutes")]
    pub long_break_minutes: u32,
    #[serde(default = "default_long_break_every")]
    pub long_break_every: u32,
}

impl Default for PomodoroSettings {
    fn default() -> Self {
        Self {
            focus_minutes: default_focus_minutes(),
            short_break_minutes: default_short_break_minutes(),
            long_break_minutes: default_long_break_minutes(),
            long_break_every: default_long_break_every(),
        }
    }
}

fn default_focus_minutes() -> u32 {
    25
}

fn default_short_break_minutes() -> u32 {
    5
}

fn default_long_break_minutes() -> u32 {
    15
}

fn default_long_break_every() -> u32 {
    4
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<TaskId>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub pomodoro_settings: Option<PomodoroSettings>,
}

impl UserProfile {
    pub fn focus_minutes(&self) -> Option<u32> {
        self.pomodoro_settings
            .as_ref()
            .map(|settings| settings.focus_minutes)
            .filter(|minutes| *minutes > 0)
    }
}

/// Projection of the reconciled session that the local countdown starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownBaseline {
    pub fsm_state: FsmState,
    pub remaining_seconds: u32,
    pub total_duration_seconds: u32,
    pub last_synced_at: DateTime<Utc>,
}

impl CountdownBaseline {
    pub fn is_ticking(&self) -> bool {
        self.fsm_state.is_ticking()
    }

    pub fn progress(&self) -> f64 {
        if self.total_duration_seconds == 0 {
            return 0.0;
        }
        (f64::from(self.remaining_seconds) / f64::from(self.total_duration_seconds)).clamp(0.0, 1.0)
    }
}

pub fn format_clock(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
