//! In-process election ledger
//!
//! Implements the election contract rules in memory so the client can be exercised without a
//! node, plus switches for injecting the failures a real network produces.

use fnv::{FnvHashMap, FnvHashSet};
use futures_util::{
    future::{ready, BoxFuture},
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    constants::SEPOLIA_NETWORK_ID,
    types::{
        Address, Candidate, ElectionWindow, LedgerCall, LedgerEvent, Receipt, SdkError, SdkResult,
        TxHash,
    },
    utils::unix_now,
    LedgerProvider, NetworkProvider,
};

const LOG_TARGET: &str = "ledger";

#[derive(Default)]
struct ElectionRecord {
    start_time: u64,
    end_time: u64,
    candidates: Vec<Candidate>,
}

#[derive(Default)]
struct Faults {
    reads_failing: bool,
    /// number of upcoming submissions the signer declines
    declined_signatures: u32,
    /// 1-based positions of registerCandidate submissions that revert on-chain
    reverted_registrations: FnvHashSet<u64>,
    /// number of upcoming `admin` reads preceded by a new election being mined
    interleaved_elections: u32,
}

struct LedgerState {
    admin: Address,
    active: bool,
    election_id: u64,
    elections: FnvHashMap<u64, ElectionRecord>,
    voters: FnvHashSet<(u64, Address)>,
    now: u64,
    tx_count: u64,
    receipts: FnvHashMap<TxHash, Receipt>,
    registrations: u64,
    submissions: Vec<(Address, LedgerCall)>,
    network_id: Option<u64>,
    accounts: Vec<Address>,
    faults: Faults,
}

impl LedgerState {
    fn current(&mut self) -> Option<&mut ElectionRecord> {
        self.elections.get_mut(&self.election_id)
    }

    fn only_admin(&self, from: Address) -> Result<(), String> {
        if from == self.admin {
            Ok(())
        } else {
            Err("Only admin can call this".into())
        }
    }

    fn only_active(&self) -> Result<(), String> {
        if self.active {
            Ok(())
        } else {
            Err("Voting is not active".into())
        }
    }

    fn start_election(&mut self, duration: u64) -> Result<Vec<LedgerEvent>, String> {
        let end_time = self
            .now
            .checked_add(duration)
            .ok_or("Duration too long")?;
        self.election_id += 1;
        self.active = true;
        let record = ElectionRecord {
            start_time: self.now,
            end_time,
            candidates: vec![],
        };
        self.elections.insert(self.election_id, record);
        Ok(vec![LedgerEvent::ElectionStarted {
            election_id: self.election_id,
        }])
    }

    /// Apply `call` following the contract rules, returning emitted events or the revert reason
    fn apply(&mut self, from: Address, call: &LedgerCall) -> Result<Vec<LedgerEvent>, String> {
        let election_id = self.election_id;
        match call {
            LedgerCall::StartElection { duration } => {
                self.only_admin(from)?;
                if self.active {
                    return Err("Election already active".into());
                }
                if *duration == 0 {
                    return Err("Duration must be positive".into());
                }
                self.start_election(*duration)
            }
            LedgerCall::StopVoting => {
                self.only_admin(from)?;
                self.only_active()?;
                self.active = false;
                Ok(vec![LedgerEvent::ElectionStopped { election_id }])
            }
            LedgerCall::ExtendElection { added } => {
                self.only_admin(from)?;
                self.only_active()?;
                let record = self.current().ok_or("No election")?;
                record.end_time = record
                    .end_time
                    .checked_add(*added)
                    .ok_or("Extension too long")?;
                Ok(vec![LedgerEvent::ElectionExtended {
                    election_id,
                    end_time: record.end_time,
                }])
            }
            LedgerCall::RegisterCandidate {
                name,
                description,
                image_url,
            } => {
                self.only_admin(from)?;
                self.only_active()?;
                if name.is_empty() {
                    return Err("Name is required".into());
                }
                let record = self.current().ok_or("No election")?;
                let id = record.candidates.len() as u64 + 1;
                record.candidates.push(Candidate {
                    id,
                    name: name.clone(),
                    description: description.clone(),
                    image_url: image_url.clone().filter(|url| !url.is_empty()),
                    vote_count: 0,
                });
                Ok(vec![LedgerEvent::CandidateRegistered {
                    election_id,
                    name: name.clone(),
                }])
            }
            LedgerCall::Vote { candidate_id } => {
                self.only_active()?;
                if self.voters.contains(&(election_id, from)) {
                    return Err("Already voted".into());
                }
                let now = self.now;
                let record = self.current().ok_or("No election")?;
                if now >= record.end_time {
                    return Err("Election has ended".into());
                }
                let candidate = record
                    .candidates
                    .iter_mut()
                    .find(|c| c.id == *candidate_id)
                    .ok_or("Invalid candidate")?;
                candidate.vote_count += 1;
                self.voters.insert((election_id, from));
                Ok(vec![LedgerEvent::VoteCast {
                    election_id,
                    voter: from,
                    candidate_id: *candidate_id,
                }])
            }
        }
    }

    fn next_tx(&mut self) -> TxHash {
        self.tx_count += 1;
        let mut hash = [0_u8; 32];
        hash[24..].copy_from_slice(&self.tx_count.to_be_bytes());
        TxHash(hash)
    }
}

/// In-memory ledger and wallet
///
/// Transactions are mined immediately on submission, `confirm` returns the stored receipt
pub struct LocalLedger {
    state: Mutex<LedgerState>,
    events: Mutex<broadcast::Sender<LedgerEvent>>,
}

impl LocalLedger {
    /// Create an empty ledger administered by `admin`, on the Sepolia network
    pub fn new(admin: Address) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(LedgerState {
                admin,
                active: false,
                election_id: 0,
                elections: Default::default(),
                voters: Default::default(),
                now: unix_now(),
                tx_count: 0,
                receipts: Default::default(),
                registrations: 0,
                submissions: vec![],
                network_id: Some(SEPOLIA_NETWORK_ID),
                accounts: vec![],
                faults: Default::default(),
            }),
            events: Mutex::new(events),
        }
    }
    /// Ledger time in unix seconds
    pub fn now(&self) -> u64 {
        self.state.lock().now
    }
    pub fn advance_time(&self, seconds: u64) {
        let mut state = self.state.lock();
        state.now = state.now.saturating_add(seconds);
    }
    /// Set the network reported to wallets, `None` makes the provider fail
    pub fn set_network_id(&self, network_id: Option<u64>) {
        self.state.lock().network_id = network_id;
    }
    /// Set the wallet's connected accounts
    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.state.lock().accounts = accounts;
    }
    /// Make every read fail until reset
    pub fn set_reads_failing(&self, failing: bool) {
        self.state.lock().faults.reads_failing = failing;
    }
    /// The signer declines the next `count` submissions
    pub fn decline_signatures(&self, count: u32) {
        self.state.lock().faults.declined_signatures = count;
    }
    /// The `nth` registerCandidate submission (1-based, counted from now) reverts when mined
    pub fn revert_registration(&self, nth: u64) {
        let mut state = self.state.lock();
        let position = state.registrations + nth;
        state.faults.reverted_registrations.insert(position);
    }
    /// The next `count` admin reads each observe a new election mined just before them
    pub fn interleave_new_election(&self, count: u32) {
        self.state.lock().faults.interleaved_elections = count;
    }
    /// Every submission received, in order, including declined and reverted ones
    pub fn submissions(&self) -> Vec<(Address, LedgerCall)> {
        self.state.lock().submissions.clone()
    }
    /// Number of live event subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.events.lock().receiver_count()
    }
    /// End every live event subscription, as a dropped node connection would
    pub fn drop_subscriptions(&self) {
        let (events, _) = broadcast::channel(64);
        drop(std::mem::replace(&mut *self.events.lock(), events));
    }
    /// Submit and confirm `call`, failing on revert
    pub async fn execute(&self, from: Address, call: LedgerCall) -> SdkResult<Receipt> {
        let tx = self.submit(from, call).await?;
        let receipt = self.confirm(tx).await?;
        if receipt.success {
            Ok(receipt)
        } else {
            Err(SdkError::SubmissionReverted(
                receipt.revert_reason.unwrap_or_default(),
            ))
        }
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> SdkResult<T>) -> SdkResult<T> {
        let state = self.state.lock();
        if state.faults.reads_failing {
            return Err(SdkError::Transport("ledger unavailable".into()));
        }
        f(&state)
    }

    fn emit(&self, events: Vec<LedgerEvent>) {
        for event in events {
            // no receivers is fine
            let _ = self.events.lock().send(event);
        }
    }

    fn submit_impl(&self, from: Address, call: LedgerCall) -> SdkResult<TxHash> {
        let mut state = self.state.lock();
        state.submissions.push((from, call.clone()));

        if state.faults.declined_signatures > 0 {
            state.faults.declined_signatures -= 1;
            return Err(SdkError::SubmissionRejected(
                "user rejected the request".into(),
            ));
        }

        let mut reverted_on_chain = false;
        if let LedgerCall::RegisterCandidate { .. } = call {
            state.registrations += 1;
            let position = state.registrations;
            reverted_on_chain = state.faults.reverted_registrations.remove(&position);
        }

        let tx = state.next_tx();
        let receipt = if reverted_on_chain {
            Receipt {
                tx,
                success: false,
                revert_reason: Some("execution reverted".into()),
            }
        } else {
            // calls failing the contract rules revert during gas estimation, before a tx exists
            let events = state
                .apply(from, &call)
                .map_err(SdkError::SubmissionReverted)?;
            debug!(target: LOG_TARGET, "mined {} from {from}: {tx}", call.name());
            drop(state);
            self.emit(events);
            state = self.state.lock();
            Receipt {
                tx,
                success: true,
                revert_reason: None,
            }
        };
        state.receipts.insert(tx, receipt);

        Ok(tx)
    }

    fn admin_impl(&self) -> SdkResult<Address> {
        let events = {
            let mut state = self.state.lock();
            if state.faults.interleaved_elections > 0 && !state.faults.reads_failing {
                state.faults.interleaved_elections -= 1;
                let duration = state
                    .current()
                    .map(|e| e.end_time.saturating_sub(e.start_time))
                    .unwrap_or(600)
                    .max(1);
                let mut events = vec![];
                if state.active {
                    state.active = false;
                    events.push(LedgerEvent::ElectionStopped {
                        election_id: state.election_id,
                    });
                }
                events.extend(state.start_election(duration).unwrap_or_default());
                events
            } else {
                vec![]
            }
        };
        self.emit(events);
        self.read(|s| Ok(s.admin))
    }
}

impl LedgerProvider for LocalLedger {
    fn admin(&self) -> BoxFuture<SdkResult<Address>> {
        ready(self.admin_impl()).boxed()
    }
    fn voting_active(&self) -> BoxFuture<SdkResult<bool>> {
        ready(self.read(|s| Ok(s.active))).boxed()
    }
    fn current_election_id(&self) -> BoxFuture<SdkResult<u64>> {
        ready(self.read(|s| Ok(s.election_id))).boxed()
    }
    fn election_window(&self, election_id: u64) -> BoxFuture<SdkResult<ElectionWindow>> {
        ready(self.read(|s| {
            Ok(s.elections
                .get(&election_id)
                .map(|e| ElectionWindow {
                    start_time: e.start_time,
                    end_time: e.end_time,
                    remaining: e.end_time.saturating_sub(s.now),
                })
                .unwrap_or_default())
        }))
        .boxed()
    }
    fn candidates_count(&self, election_id: u64) -> BoxFuture<SdkResult<u64>> {
        ready(self.read(|s| {
            Ok(s.elections
                .get(&election_id)
                .map(|e| e.candidates.len() as u64)
                .unwrap_or_default())
        }))
        .boxed()
    }
    fn candidate(&self, election_id: u64, candidate_id: u64) -> BoxFuture<SdkResult<Candidate>> {
        ready(self.read(|s| {
            s.elections
                .get(&election_id)
                .and_then(|e| e.candidates.iter().find(|c| c.id == candidate_id))
                .cloned()
                .ok_or_else(|| {
                    SdkError::Transport(format!("no candidate {candidate_id} in {election_id}"))
                })
        }))
        .boxed()
    }
    fn has_voted(&self, election_id: u64, voter: Address) -> BoxFuture<SdkResult<bool>> {
        ready(self.read(|s| Ok(s.voters.contains(&(election_id, voter))))).boxed()
    }
    fn submit(&self, from: Address, call: LedgerCall) -> BoxFuture<SdkResult<TxHash>> {
        ready(self.submit_impl(from, call)).boxed()
    }
    fn confirm(&self, tx: TxHash) -> BoxFuture<SdkResult<Receipt>> {
        ready(
            self.state
                .lock()
                .receipts
                .get(&tx)
                .cloned()
                .ok_or_else(|| SdkError::Transport(format!("unknown transaction {tx}"))),
        )
        .boxed()
    }
    fn subscribe_events(&self) -> BoxFuture<SdkResult<BoxStream<'static, LedgerEvent>>> {
        let result = self.read(|_| Ok(())).map(|_| {
            stream::unfold(self.events.lock().subscribe(), |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => return Some((event, rx)),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(target: LOG_TARGET, "subscriber lagged, {missed} events dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            })
            .boxed()
        });
        ready(result).boxed()
    }
}

impl NetworkProvider for LocalLedger {
    fn network_id(&self) -> BoxFuture<SdkResult<u64>> {
        ready(
            self.state
                .lock()
                .network_id
                .ok_or_else(|| SdkError::Transport("provider unavailable".into())),
        )
        .boxed()
    }
    fn accounts(&self) -> BoxFuture<SdkResult<Vec<Address>>> {
        ready(Ok(self.state.lock().accounts.clone())).boxed()
    }
}
