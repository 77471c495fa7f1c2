use std::sync::Arc;

use futures_util::{Future, StreamExt};
use log::{debug, warn};
use tokio::{
    sync::mpsc::{channel, error::TrySendError, Sender},
    task::JoinHandle,
};

use crate::{
    async_utils::{retry_policy::TaskRetryPolicy, spawn_retry_task},
    LedgerProvider,
};

const LOG_TARGET: &str = "events";

/// Handle for requesting a snapshot refresh
///
/// Requests made while a refresh is running collapse into a single follow-up refresh
#[derive(Clone)]
pub struct Invalidator {
    tx: Sender<()>,
}

impl Invalidator {
    /// Request a refresh, never blocks
    pub fn invalidate(&self) {
        match self.tx.try_send(()) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                debug!(target: LOG_TARGET, "refresh already pending");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: LOG_TARGET, "reconciler stopped, invalidation ignored");
            }
        }
    }
}

/// Runs refreshes in response to invalidations, one at a time
pub struct Reconciler {
    invalidator: Invalidator,
    task: JoinHandle<()>,
}

impl Reconciler {
    /// Spawn the reconciliation loop
    ///
    /// `refresh_fn` builds the refresh future for each run
    pub fn spawn<F, G>(refresh_fn: G) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
        G: Fn() -> F + Send + 'static,
    {
        // capacity 1: one pending request is enough to cover any number of invalidations
        let (tx, mut rx) = channel::<()>(1);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                refresh_fn().await;
            }
        });

        Self {
            invalidator: Invalidator { tx },
            task,
        }
    }
    pub fn invalidator(&self) -> Invalidator {
        self.invalidator.clone()
    }
    pub fn invalidate(&self) {
        self.invalidator.invalidate();
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Turns ledger notifications into refresh requests
pub struct EventSubscriber;

impl EventSubscriber {
    /// Subscribe to ledger events, invalidating on each
    ///
    /// Event payloads are never consumed. A dropped upstream subscription is re-established
    /// according to `retry_policy`.
    pub fn subscribe<L: LedgerProvider>(
        ledger: Arc<L>,
        invalidator: Invalidator,
        retry_policy: impl TaskRetryPolicy,
    ) -> LedgerEventStream {
        let task = spawn_retry_task(
            move || {
                InvalidationStream {
                    ledger: Arc::clone(&ledger),
                    invalidator: invalidator.clone(),
                }
                .stream_fn()
            },
            retry_policy,
        );

        LedgerEventStream { task }
    }
}

struct InvalidationStream<L: LedgerProvider> {
    ledger: Arc<L>,
    invalidator: Invalidator,
}

impl<L: LedgerProvider> InvalidationStream<L> {
    /// Returns true if at least one event was received
    async fn stream_fn(self) -> bool {
        let mut events = match self.ledger.subscribe_events().await {
            Ok(events) => events,
            Err(err) => {
                warn!(target: LOG_TARGET, "event subscription failed: {err}");
                return false;
            }
        };
        debug!(target: LOG_TARGET, "subscribed to ledger events");

        let mut received = false;
        while let Some(event) = events.next().await {
            debug!(target: LOG_TARGET, "{} invalidates snapshot", event.name());
            received = true;
            self.invalidator.invalidate();
        }
        warn!(target: LOG_TARGET, "event stream ended");
        // anything may have changed while disconnected
        self.invalidator.invalidate();

        received
    }
}

/// A live ledger event subscription
///
/// Dropping the handle ends the subscription
pub struct LedgerEventStream {
    task: JoinHandle<()>,
}

impl LedgerEventStream {
    /// End the subscription
    pub fn unsubscribe(&self) {
        self.task.abort();
    }
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LedgerEventStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        async_utils::retry_policy, local_ledger::LocalLedger, types::Address,
        types::LedgerCall,
    };

    const ADMIN: Address = Address::new([1; 20]);

    async fn wait_for(count: &AtomicU32, expected: u32) {
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {expected} runs, got {}",
            count.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn invalidations_coalesce_during_refresh() {
        let _ = env_logger::try_init();
        let runs = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Semaphore::new(0));

        let reconciler = {
            let runs = Arc::clone(&runs);
            let gate = Arc::clone(&gate);
            Reconciler::spawn(move || {
                let runs = Arc::clone(&runs);
                let gate = Arc::clone(&gate);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.acquire().await.expect("open").forget();
                }
            })
        };

        reconciler.invalidate();
        wait_for(&runs, 1).await;

        // first refresh is blocked on the gate
        for _ in 0..3 {
            reconciler.invalidate();
        }
        gate.add_permits(10);
        wait_for(&runs, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn events_trigger_refresh() {
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        let runs = Arc::new(AtomicU32::new(0));
        let reconciler = {
            let runs = Arc::clone(&runs);
            Reconciler::spawn(move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let stream = EventSubscriber::subscribe(
            Arc::clone(&ledger),
            reconciler.invalidator(),
            retry_policy::never(),
        );
        for _ in 0..20 {
            if ledger.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ledger.subscriber_count(), 1);

        ledger
            .execute(ADMIN, LedgerCall::StartElection { duration: 60 })
            .await
            .unwrap();
        wait_for(&runs, 1).await;

        stream.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.is_finished());
        assert_eq!(ledger.subscriber_count(), 0);

        // no more refreshes once unsubscribed
        let before = runs.load(Ordering::SeqCst);
        ledger
            .execute(ADMIN, LedgerCall::StopVoting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn dropped_stream_is_reestablished() {
        let _ = env_logger::try_init();
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        let runs = Arc::new(AtomicU32::new(0));
        let reconciler = {
            let runs = Arc::clone(&runs);
            Reconciler::spawn(move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let subscribers = |expected: usize| {
            let ledger = Arc::clone(&ledger);
            async move {
                for _ in 0..100 {
                    if ledger.subscriber_count() == expected {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                panic!("expected {expected} subscribers, got {}", ledger.subscriber_count());
            }
        };

        let stream = EventSubscriber::subscribe(
            Arc::clone(&ledger),
            reconciler.invalidator(),
            retry_policy::exponential_backoff(1).base_delay(Duration::from_millis(20)),
        );
        subscribers(1).await;

        ledger.drop_subscriptions();
        assert_eq!(ledger.subscriber_count(), 0);
        // the end of the stream is itself an invalidation
        wait_for(&runs, 1).await;
        subscribers(1).await;
        assert!(!stream.is_finished());

        let before = runs.load(Ordering::SeqCst);
        ledger
            .execute(ADMIN, LedgerCall::StartElection { duration: 60 })
            .await
            .unwrap();
        wait_for(&runs, before + 1).await;

        // a stream that delivered events resets the attempt count
        ledger.drop_subscriptions();
        subscribers(1).await;

        // an unproductive run after the single allowed retry is final
        ledger.drop_subscriptions();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stream.is_finished());
        assert_eq!(ledger.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failed_subscription_is_not_fatal() {
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        ledger.set_reads_failing(true);
        let reconciler = Reconciler::spawn(|| async {});

        let stream = EventSubscriber::subscribe(
            Arc::clone(&ledger),
            reconciler.invalidator(),
            retry_policy::never(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.is_finished());
        assert_eq!(ledger.subscriber_count(), 0);
    }
}
