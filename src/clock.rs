//! Local countdown over the election time window

use std::{sync::Arc, time::Duration};

use log::{debug, info};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{event_subscriber::Invalidator, state_reader::Snapshot, utils::unix_now};

const LOG_TARGET: &str = "clock";

/// Combined clock and ledger view of an election
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockView {
    pub election_id: u64,
    /// seconds until the end time, negative once passed
    pub remaining: i64,
    /// locally derived, false once the end time passed
    pub clock_active: bool,
    /// as last read from the ledger
    pub ledger_active: bool,
}

impl ClockView {
    /// Whether voting should be offered
    pub fn display_active(&self) -> bool {
        self.clock_active && self.ledger_active
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockTransition {
    /// the end time passed while the ledger still reports voting open
    Expired,
}

/// Ticks an election countdown
///
/// The clock's own flag never replaces the ledger flag, both are kept and combined on display
#[derive(Debug, Default)]
pub struct ElectionClock {
    election_id: u64,
    end_time: u64,
    remaining: i64,
    clock_active: bool,
    ledger_active: bool,
    halted: bool,
}

impl ElectionClock {
    pub fn new(snapshot: &Snapshot) -> Self {
        let mut clock = Self {
            halted: true,
            ..Default::default()
        };
        clock.observe(snapshot);
        clock
    }
    /// Take in an authoritative snapshot
    ///
    /// A new election or a later end time re-arms the countdown, an inactive ledger halts it
    pub fn observe(&mut self, snapshot: &Snapshot) {
        let rearm = snapshot.election_id != self.election_id
            || snapshot.window.end_time > self.end_time;
        self.election_id = snapshot.election_id;
        self.end_time = snapshot.window.end_time;
        self.ledger_active = snapshot.active;

        if !snapshot.active {
            if !self.halted {
                debug!(target: LOG_TARGET, "election {} closed by ledger, halting", self.election_id);
            }
            self.halted = true;
            return;
        }
        if rearm || self.halted {
            self.clock_active = true;
            self.halted = false;
        }
    }
    /// Advance to `now` (unix seconds)
    pub fn tick(&mut self, now: u64) -> Option<ClockTransition> {
        if self.halted {
            return None;
        }
        let end_time = i64::try_from(self.end_time).unwrap_or(i64::MAX);
        let now = i64::try_from(now).unwrap_or(i64::MAX);
        self.remaining = end_time.saturating_sub(now);
        if self.remaining <= 0 && self.clock_active {
            self.clock_active = false;
            return Some(ClockTransition::Expired);
        }
        None
    }
    pub fn is_halted(&self) -> bool {
        self.halted
    }
    pub fn view(&self) -> ClockView {
        ClockView {
            election_id: self.election_id,
            remaining: self.remaining,
            clock_active: self.clock_active,
            ledger_active: self.ledger_active,
        }
    }
    /// Run the clock once per second against published snapshots
    ///
    /// Expiry requests a refresh through `invalidator` so the ledger can confirm it
    pub fn spawn(
        mut snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
        invalidator: Invalidator,
    ) -> ClockHandle {
        let mut clock = Self {
            halted: true,
            ..Default::default()
        };
        if let Some(snapshot) = snapshots.borrow_and_update().as_deref() {
            clock.observe(snapshot);
        }
        let (view_tx, view_rx) = watch::channel(clock.view());

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        if let Some(snapshot) = snapshot {
                            clock.observe(&snapshot);
                        }
                    }
                    _ = interval.tick(), if !clock.is_halted() => {
                        if let Some(ClockTransition::Expired) = clock.tick(unix_now()) {
                            info!(target: LOG_TARGET, "election {} time is up", clock.election_id);
                            invalidator.invalidate();
                        }
                    }
                }
                view_tx.send_replace(clock.view());
            }
        });

        ClockHandle { view: view_rx, task }
    }
}

/// A running clock
///
/// Dropping the handle stops the clock
pub struct ClockHandle {
    view: watch::Receiver<ClockView>,
    task: JoinHandle<()>,
}

impl ClockHandle {
    pub fn view(&self) -> ClockView {
        *self.view.borrow()
    }
    /// Receive every view update
    pub fn subscribe(&self) -> watch::Receiver<ClockView> {
        self.view.clone()
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_subscriber::Reconciler, types::ElectionWindow};

    const NOW: u64 = 1_735_725_600;

    fn snapshot(election_id: u64, active: bool, end_time: u64) -> Snapshot {
        Snapshot {
            election_id,
            active,
            window: ElectionWindow {
                start_time: NOW - 60,
                end_time,
                remaining: end_time.saturating_sub(NOW),
            },
            ..Default::default()
        }
    }

    #[test]
    fn expires_exactly_once() {
        let mut clock = ElectionClock::new(&snapshot(1, true, NOW + 10));
        let mut transitions = vec![];
        for second in 1..=15 {
            if let Some(t) = clock.tick(NOW + second) {
                transitions.push((second, t));
            }
        }
        assert_eq!(transitions, vec![(10, ClockTransition::Expired)]);

        let view = clock.view();
        assert!(!view.clock_active);
        assert!(view.ledger_active);
        assert!(!view.display_active());
        assert_eq!(view.remaining, -5);
    }

    #[test]
    fn display_combines_clock_and_ledger() {
        // both agree voting is open
        let mut clock = ElectionClock::new(&snapshot(1, true, NOW + 10));
        clock.tick(NOW);
        assert!(clock.view().display_active());

        // ledger closed early (admin stop) while time remains
        clock.observe(&snapshot(1, false, NOW + 10));
        let view = clock.view();
        assert!(view.clock_active);
        assert!(!view.ledger_active);
        assert!(!view.display_active());

        // time ran out while the ledger still says active
        let mut clock = ElectionClock::new(&snapshot(1, true, NOW + 1));
        clock.tick(NOW + 1);
        let view = clock.view();
        assert!(!view.clock_active);
        assert!(view.ledger_active);
        assert!(!view.display_active());
    }

    #[test]
    fn inactive_ledger_halts_ticking() {
        let mut clock = ElectionClock::new(&snapshot(1, true, NOW + 2));
        assert_eq!(clock.tick(NOW + 2), Some(ClockTransition::Expired));
        clock.observe(&snapshot(1, false, NOW + 2));
        assert!(clock.is_halted());
        for second in 3..10 {
            assert_eq!(clock.tick(NOW + second), None);
        }
        // observing the same closed election again changes nothing
        clock.observe(&snapshot(1, false, NOW + 2));
        assert!(clock.is_halted());
        assert!(!clock.view().display_active());
    }

    #[test]
    fn extension_and_new_election_rearm() {
        let mut clock = ElectionClock::new(&snapshot(1, true, NOW + 1));
        assert_eq!(clock.tick(NOW + 1), Some(ClockTransition::Expired));

        clock.observe(&snapshot(1, true, NOW + 60));
        assert!(clock.view().display_active());
        assert_eq!(clock.tick(NOW + 2), None);
        assert_eq!(clock.view().remaining, 58);

        clock.observe(&snapshot(1, false, NOW + 60));
        clock.observe(&snapshot(2, true, NOW + 120));
        assert!(!clock.is_halted());
        assert!(clock.view().display_active());
    }

    #[test]
    fn far_future_end_time_keeps_counting() {
        let mut clock = ElectionClock::new(&snapshot(1, true, u64::MAX));
        assert_eq!(clock.tick(NOW), None);
        let view = clock.view();
        assert!(view.clock_active);
        assert_eq!(view.remaining, i64::MAX - NOW as i64);
        assert!(view.display_active());
    }

    #[test]
    fn no_election_never_ticks() {
        let mut clock = ElectionClock::new(&Snapshot::default());
        assert!(clock.is_halted());
        assert_eq!(clock.tick(NOW), None);
        assert!(!clock.view().display_active());
    }

    #[tokio::test]
    async fn spawned_clock_requests_refresh_on_expiry() {
        let runs = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let reconciler = {
            let runs = Arc::clone(&runs);
            Reconciler::spawn(move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };
        let now = unix_now();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(Some(Arc::new(snapshot(1, true, now.saturating_sub(1)))));

        let handle = ElectionClock::spawn(snapshot_rx, reconciler.invalidator());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = handle.view();
        assert!(!view.clock_active);
        assert!(view.ledger_active);
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);

        snapshot_tx.send_replace(Some(Arc::new(snapshot(1, false, now.saturating_sub(1)))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.view().ledger_active);
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
