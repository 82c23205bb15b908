use crate::domain::models::CountdownBaseline;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

const TICK: Duration = Duration::from_secs(1);

/// Visible countdown between reconciliations. Follows the baseline channel:
/// every new baseline replaces the displayed value immediately, and while
/// the state is ticking the value drops by one each second down to zero.
/// Paused states tick as well; see `FsmState::is_ticking`.
pub struct CountdownTicker {
    remaining: watch::Receiver<u32>,
    task: JoinHandle<()>,
}

impl CountdownTicker {
    pub fn spawn(mut baselines: watch::Receiver<CountdownBaseline>) -> Self {
        let initial = *baselines.borrow_and_update();
        let (sender, remaining) = watch::channel(initial.remaining_seconds);
        let task = tokio::spawn(run(baselines, sender, initial));
        Self { remaining, task }
    }

    pub fn remaining_seconds(&self) -> u32 {
        *self.remaining.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.remaining.clone()
    }
}

impl Drop for CountdownTicker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut baselines: watch::Receiver<CountdownBaseline>,
    remaining: watch::Sender<u32>,
    mut baseline: CountdownBaseline,
) {
    loop {
        remaining.send_replace(baseline.remaining_seconds);

        if baseline.is_ticking() && baseline.remaining_seconds > 0 {
            if !count_down(&mut baselines, &remaining, baseline.remaining_seconds).await {
                return;
            }
        } else if baselines.changed().await.is_err() {
            return;
        }
        baseline = *baselines.borrow_and_update();
    }
}

/// Returns once a new baseline arrives, `false` if the source is gone.
async fn count_down(
    baselines: &mut watch::Receiver<CountdownBaseline>,
    remaining: &watch::Sender<u32>,
    mut current: u32,
) -> bool {
    let mut ticks = interval_at(Instant::now() + TICK, TICK);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while current > 0 {
        tokio::select! {
            changed = baselines.changed() => return changed.is_ok(),
            _ = ticks.tick() => {
                current = current.saturating_sub(1);
                remaining.send_replace(current);
            }
        }
    }
    baselines.changed().await.is_ok()
}
