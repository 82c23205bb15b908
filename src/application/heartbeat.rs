use crate::application::api::SessionApi;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Periodic liveness ping. Lives exactly as long as this value; failures are
/// logged and otherwise ignored.
pub struct HeartbeatEmitter {
    task: JoinHandle<()>,
    period: Duration,
}

impl HeartbeatEmitter {
    pub fn start<A: SessionApi + 'static>(api: Arc<A>, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if let Err(error) = api.send_heartbeat().await {
                    tracing::debug!(%error, "heartbeat failed");
                }
            }
        });
        tracing::debug!(period_secs = period.as_secs(), "heartbeat started");
        Self { task, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::reconciler::tests::FakeSessionApi;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_period() {
        let api = Arc::new(FakeSessionApi::default());
        let heartbeat = HeartbeatEmitter::start(Arc::clone(&api), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 3);
        assert!(heartbeat.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let api = Arc::new(FakeSessionApi::default());
        api.fail_requests.store(true, Ordering::SeqCst);
        let heartbeat = HeartbeatEmitter::start(Arc::clone(&api), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 2);
        assert!(heartbeat.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_ticks() {
        let api = Arc::new(FakeSessionApi::default());
        let heartbeat = HeartbeatEmitter::start(Arc::clone(&api), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 1);

        heartbeat.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(api.heartbeats.load(Ordering::SeqCst), 1);
    }
}
