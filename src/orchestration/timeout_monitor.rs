use super::interrupts::{AbortReason, ExecutionInterrupt, InterruptSender};
use dashmap::DashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// One sleeping task per suspended instance. On expiry it queues an abort; the
/// orchestrator's compare-and-set transitions make sure it lands at most once.
#[derive(Debug)]
pub struct TimeoutMonitor {
    timers: DashMap<Uuid, JoinHandle<()>>,
    interrupts: InterruptSender,
}

impl TimeoutMonitor {
    pub fn new(interrupts: InterruptSender) -> Self {
        Self {
            timers: DashMap::new(),
            interrupts,
        }
    }

    /// Start the timer for an instance, replacing any previous one
    pub fn arm(&self, instance_id: Uuid, after: Duration) {
        let interrupts = self.interrupts.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(instance_id = %instance_id, timeout_ms = after.as_millis() as u64, "Instance timed out");
            if interrupts
                .send(ExecutionInterrupt::Abort {
                    instance_id,
                    reason: AbortReason::Timeout(after),
                })
                .is_err()
            {
                warn!(instance_id = %instance_id, "Interrupt queue closed, timeout dropped");
            }
        });
        if let Some(previous) = self.timers.insert(instance_id, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self, instance_id: Uuid) {
        if let Some((_, handle)) = self.timers.remove(&instance_id) {
            handle.abort();
        }
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.value().abort();
        }
    }
}
