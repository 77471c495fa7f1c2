//! Consistent snapshots of election ledger state

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use futures_util::future::try_join_all;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    types::{Address, Candidate, ElectionWindow, SdkError, SdkResult},
    utils::unix_now,
    winner::{resolve_winners, Winners},
    LedgerProvider,
};

const LOG_TARGET: &str = "reader";

/// Immutable view of ledger state read at one instant
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// current election id, 0 if no election was ever started
    pub election_id: u64,
    pub admin: Address,
    /// ledger-reported voting flag
    pub active: bool,
    pub window: ElectionWindow,
    /// roster of the current election in registration order
    pub candidates: Vec<Candidate>,
    /// account the voter status was read for
    pub caller: Option<Address>,
    /// whether `caller` has voted in the current election
    pub has_voted: bool,
    /// local unix time the read batch completed
    pub fetched_at: u64,
}

impl Snapshot {
    pub fn is_admin(&self, account: &Address) -> bool {
        &self.admin == account
    }

    pub fn total_votes(&self) -> u64 {
        self.candidates.iter().map(|c| c.vote_count).sum()
    }

    /// Find a candidate of the current election
    pub fn candidate(&self, id: u64) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// Check `self` does not move ledger state backwards relative to `previous`
    ///
    /// Ledger state is append-only so a regression means the read was served by a lagging node
    fn check_progress(&self, previous: &Snapshot) -> SdkResult<()> {
        if self.election_id < previous.election_id {
            return Err(SdkError::StaleRead(format!(
                "election id went from {} to {}",
                previous.election_id, self.election_id
            )));
        }
        if self.election_id > previous.election_id {
            return Ok(());
        }

        if self.active && !previous.active && previous.election_id != 0 {
            return Err(SdkError::StaleRead(format!(
                "election {} re-opened",
                self.election_id
            )));
        }
        if self.candidates.len() < previous.candidates.len() {
            return Err(SdkError::StaleRead(format!(
                "roster shrank from {} to {}",
                previous.candidates.len(),
                self.candidates.len()
            )));
        }
        for (old, new) in previous.candidates.iter().zip(self.candidates.iter()) {
            if new.vote_count < old.vote_count {
                return Err(SdkError::StaleRead(format!(
                    "candidate {} votes went from {} to {}",
                    old.id, old.vote_count, new.vote_count
                )));
            }
        }
        if previous.has_voted && !self.has_voted && previous.caller == self.caller {
            return Err(SdkError::StaleRead("voter status reverted".into()));
        }

        Ok(())
    }
}

/// Results of any past or current election
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionResults {
    pub election_id: u64,
    pub window: ElectionWindow,
    /// sorted by votes descending, ties by ascending id
    pub standings: Vec<Candidate>,
    pub total_votes: u64,
    pub winners: Option<Winners>,
}

/// Reads ledger state in consistent batches and holds the latest good snapshot
pub struct LedgerStateReader<L: LedgerProvider> {
    ledger: Arc<L>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    stale: AtomicBool,
    /// ticket handed to each refresh, in start order
    next_ticket: AtomicU64,
    /// ticket of the refresh that published the current snapshot
    published_ticket: Mutex<u64>,
}

impl<L: LedgerProvider> LedgerStateReader<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            ledger,
            snapshot_tx,
            stale: AtomicBool::new(false),
            next_ticket: AtomicU64::new(1),
            published_ticket: Mutex::new(0),
        }
    }
    /// Latest consistent snapshot, if any read ever succeeded
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshot_tx.borrow().clone()
    }
    /// True if the last refresh failed and `latest` may be out of date
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }
    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot_tx.subscribe()
    }
    /// Read a new snapshot, reading voter status of `caller` if given
    ///
    /// On failure the held snapshot is untouched and the reader is marked stale
    pub async fn refresh(&self, caller: Option<Address>) -> SdkResult<Arc<Snapshot>> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::AcqRel);
        let result = match self.read_consistent(caller).await {
            Ok(snapshot) => self.publish(ticket, snapshot),
            Err(err) => Err(err),
        };

        match result {
            Ok(snapshot) => {
                self.stale.store(false, Ordering::Release);
                Ok(snapshot)
            }
            Err(err) => {
                warn!(target: LOG_TARGET, "refresh failed, keeping last snapshot: {err}");
                self.stale.store(true, Ordering::Release);
                Err(err)
            }
        }
    }
    /// Read results of election `election_id`
    ///
    /// Does not affect the held snapshot
    pub async fn election_results(&self, election_id: u64) -> SdkResult<ElectionResults> {
        let current = self.ledger.current_election_id().await.map_err(read_failure)?;
        if election_id == 0 || election_id > current {
            return Err(SdkError::UnknownElection(election_id));
        }
        let (window, mut standings) = tokio::try_join!(
            self.ledger.election_window(election_id),
            self.read_candidates(election_id),
        )
        .map_err(read_failure)?;

        let total_votes = standings.iter().map(|c| c.vote_count).sum();
        let winners = resolve_winners(&standings);
        standings.sort_by(|a, b| b.vote_count.cmp(&a.vote_count).then(a.id.cmp(&b.id)));

        Ok(ElectionResults {
            election_id,
            window,
            standings,
            total_votes,
            winners,
        })
    }

    fn publish(&self, ticket: u64, snapshot: Snapshot) -> SdkResult<Arc<Snapshot>> {
        let mut published_ticket = self.published_ticket.lock();
        let previous = self.latest();
        if ticket < *published_ticket {
            // a refresh that started later already published
            debug!(target: LOG_TARGET, "dropping superseded read #{ticket}");
            return previous.ok_or_else(|| SdkError::StaleRead("superseded".into()));
        }
        if let Some(previous) = previous.as_deref() {
            snapshot.check_progress(previous)?;
        }

        let snapshot = Arc::new(snapshot);
        *published_ticket = ticket;
        self.snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));
        debug!(
            target: LOG_TARGET,
            "published snapshot #{ticket}: election {}, active {}, {} candidates",
            snapshot.election_id,
            snapshot.active,
            snapshot.candidates.len()
        );

        Ok(snapshot)
    }

    /// Read a batch, retrying once if it straddled two elections
    async fn read_consistent(&self, caller: Option<Address>) -> SdkResult<Snapshot> {
        match self.read_batch(caller).await? {
            Ok(snapshot) => Ok(snapshot),
            Err((started, observed)) => {
                debug!(target: LOG_TARGET, "election changed mid-read ({started} -> {observed}), retrying");
                self.read_batch(caller)
                    .await?
                    .map_err(|(started, observed)| SdkError::InconsistentRead { started, observed })
            }
        }
    }

    /// Read one batch
    ///
    /// Returns the snapshot or the (started, observed) election ids if the batch straddled two elections
    async fn read_batch(&self, caller: Option<Address>) -> SdkResult<Result<Snapshot, (u64, u64)>> {
        let started = self
            .ledger
            .current_election_id()
            .await
            .map_err(read_failure)?;

        let (active, admin, observed, window, candidates, has_voted) = tokio::try_join!(
            self.ledger.voting_active(),
            self.ledger.admin(),
            self.ledger.current_election_id(),
            self.ledger.election_window(started),
            self.read_candidates(started),
            self.read_has_voted(started, caller),
        )
        .map_err(read_failure)?;

        if observed != started {
            return Ok(Err((started, observed)));
        }

        Ok(Ok(Snapshot {
            election_id: started,
            admin,
            active,
            window,
            candidates,
            caller,
            has_voted,
            fetched_at: unix_now(),
        }))
    }

    async fn read_candidates(&self, election_id: u64) -> SdkResult<Vec<Candidate>> {
        if election_id == 0 {
            return Ok(vec![]);
        }
        let count = self.ledger.candidates_count(election_id).await?;
        try_join_all((1..=count).map(|id| self.ledger.candidate(election_id, id))).await
    }

    async fn read_has_voted(&self, election_id: u64, caller: Option<Address>) -> SdkResult<bool> {
        match caller {
            Some(voter) if election_id != 0 => self.ledger.has_voted(election_id, voter).await,
            _ => Ok(false),
        }
    }
}

fn read_failure(err: SdkError) -> SdkError {
    match err {
        SdkError::ReadFailure(_) => err,
        other => SdkError::ReadFailure(other.to_string()),
    }
}
