// Lease Reaper - returns abandoned jobs to the queue
//
// A worker that crashes or stalls past the visibility timeout leaves its
// job in Processing. The reaper sweeps on a fixed interval:
// - Expired lease, attempts left -> Pending, claimable immediately
// - Expired lease, budget used up -> Failed, surfaced for manual review

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::queue::JobQueue;

/// Lease reaper configuration
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Lease reaper - periodically requeues jobs whose worker went away
pub struct LeaseReaper {
    config: ReaperConfig,
    queue: Arc<JobQueue>,
}

impl LeaseReaper {
    pub fn new(config: ReaperConfig, queue: Arc<JobQueue>) -> Self {
        Self { config, queue }
    }

    /// Start the reaper (runs in background until shutdown)
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let config = self.config.clone();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            info!("⏰ Lease reaper sweeping every {:?}", config.interval);
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.reap().await {
                            error!("❌ Lease sweep failed: {:?}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("✓ Lease reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::RewardInstruction;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::models::*;
    use crate::ledger::store::RewardStore;
    use crate::queue::RetryPolicy;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_reaper_requeues_expired_lease() {
        let store = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            RetryPolicy::default(),
            chrono::Duration::seconds(300),
        ));
        let id = queue
            .enqueue(&RewardInstruction {
                repository_id: Uuid::new_v4(),
                pr_number: 1,
                comment_id: 1,
                commentor_github_id: 5,
                contributor_github_id: 99,
                amount: dec!(1),
                currency: Currency::Usdc,
                chain: Chain::Polygon,
            })
            .await
            .unwrap()
            .job_id();
        queue.claim().await.unwrap().unwrap();
        store.expire_lease(id, Utc::now() - chrono::Duration::seconds(1));

        let (tx, rx) = watch::channel(false);
        let reaper = LeaseReaper::new(
            ReaperConfig {
                interval: Duration::from_millis(5),
            },
            queue,
        );
        let handle = reaper.start(rx);

        let mut status = JobStatus::Processing;
        for _ in 0..200 {
            status = store.get_job(id).await.unwrap().unwrap().status;
            if status == JobStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, JobStatus::Pending);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
