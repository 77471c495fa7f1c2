use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    network::NetworkGuard,
    state_reader::LedgerStateReader,
    types::{Address, LedgerCall, Receipt, SdkError, SdkResult},
    winner::Announcement,
    LedgerProvider, NetworkProvider, SessionHandle,
};

const LOG_TARGET: &str = "dispatch";

/// Submits mutating calls to the ledger
///
/// Pre-checks here only save the user a doomed signature, the ledger enforces every rule itself.
pub struct ActionDispatcher<L: LedgerProvider, N: NetworkProvider> {
    ledger: Arc<L>,
    reader: Arc<LedgerStateReader<L>>,
    guard: NetworkGuard<N>,
    session: SessionHandle,
    /// last winner announcement, belongs to the election it was computed for
    announcement: Arc<Mutex<Option<Announcement>>>,
}

impl<L: LedgerProvider, N: NetworkProvider> Clone for ActionDispatcher<L, N> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            reader: Arc::clone(&self.reader),
            guard: self.guard.clone(),
            session: Arc::clone(&self.session),
            announcement: Arc::clone(&self.announcement),
        }
    }
}

impl<L: LedgerProvider, N: NetworkProvider> ActionDispatcher<L, N> {
    pub fn new(
        ledger: Arc<L>,
        reader: Arc<LedgerStateReader<L>>,
        guard: NetworkGuard<N>,
        session: SessionHandle,
        announcement: Arc<Mutex<Option<Announcement>>>,
    ) -> Self {
        Self {
            ledger,
            reader,
            guard,
            session,
            announcement,
        }
    }
    /// Submit `call` and wait for it to be mined
    ///
    /// Returns the receipt of a successful call. A declined signature, a revert or a failed
    /// confirmation leaves local state untouched and carries the underlying reason.
    pub async fn submit(&self, call: LedgerCall) -> SdkResult<Receipt> {
        self.guard.ensure().await?;
        let account = self.account()?;

        if call.requires_admin() {
            let snapshot = match self.reader.latest() {
                Some(snapshot) => snapshot,
                None => self.reader.refresh(Some(account)).await?,
            };
            if !snapshot.is_admin(&account) {
                debug!(target: LOG_TARGET, "{account} is not admin, {} not sent", call.name());
                return Err(SdkError::Unauthorized { account });
            }
        }

        let name = call.name();
        info!(target: LOG_TARGET, "sending {name} from {account}");
        let tx = self.ledger.submit(account, call).await.map_err(|err| {
            warn!(target: LOG_TARGET, "{name} not sent: {err}");
            err
        })?;
        debug!(target: LOG_TARGET, "{name} sent: {tx}");

        let receipt = self.ledger.confirm(tx).await?;
        if !receipt.success {
            let reason = receipt
                .revert_reason
                .unwrap_or_else(|| "execution reverted".to_string());
            warn!(target: LOG_TARGET, "{name} reverted: {reason}");
            return Err(SdkError::SubmissionReverted(reason));
        }
        info!(target: LOG_TARGET, "{name} confirmed: {tx}");

        self.announcement.lock().take();
        if let Err(err) = self.reader.refresh(Some(account)).await {
            // the call is mined, the next trigger will pick it up
            warn!(target: LOG_TARGET, "refresh after {name} failed: {err}");
        }

        Ok(receipt)
    }

    pub async fn vote(&self, candidate_id: u64) -> SdkResult<Receipt> {
        self.submit(LedgerCall::Vote { candidate_id }).await
    }

    /// Open a new election lasting `duration` seconds
    pub async fn start_election(&self, duration: u64) -> SdkResult<Receipt> {
        self.submit(LedgerCall::StartElection { duration }).await
    }

    pub async fn stop_voting(&self) -> SdkResult<Receipt> {
        self.submit(LedgerCall::StopVoting).await
    }

    /// Push the current election's end time back by `added` seconds
    pub async fn extend_election(&self, added: u64) -> SdkResult<Receipt> {
        self.submit(LedgerCall::ExtendElection { added }).await
    }

    pub async fn register_candidate(
        &self,
        name: &str,
        description: &str,
        image_url: Option<String>,
    ) -> SdkResult<Receipt> {
        self.submit(LedgerCall::RegisterCandidate {
            name: name.to_string(),
            description: description.to_string(),
            image_url,
        })
        .await
    }

    pub(crate) fn reader(&self) -> &LedgerStateReader<L> {
        &self.reader
    }

    fn account(&self) -> SdkResult<Address> {
        self.session.read().account.ok_or(SdkError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;

    use super::*;
    use crate::{constants::SEPOLIA_NETWORK_ID, local_ledger::LocalLedger, Session};

    const ADMIN: Address = Address::new([1; 20]);
    const VOTER: Address = Address::new([2; 20]);

    fn dispatcher(
        ledger: &Arc<LocalLedger>,
        account: Option<Address>,
    ) -> ActionDispatcher<LocalLedger, LocalLedger> {
        let session = Session {
            account,
            network_id: Some(SEPOLIA_NETWORK_ID),
            on_required_network: true,
            is_admin: account == Some(ADMIN),
        };
        ActionDispatcher::new(
            Arc::clone(ledger),
            Arc::new(LedgerStateReader::new(Arc::clone(ledger))),
            NetworkGuard::new(Arc::clone(ledger), SEPOLIA_NETWORK_ID),
            Arc::new(RwLock::new(Arc::new(session))),
            Default::default(),
        )
    }

    fn all_calls() -> Vec<LedgerCall> {
        vec![
            LedgerCall::Vote { candidate_id: 1 },
            LedgerCall::StartElection { duration: 60 },
            LedgerCall::StopVoting,
            LedgerCall::ExtendElection { added: 60 },
            LedgerCall::RegisterCandidate {
                name: "alice".into(),
                description: String::new(),
                image_url: None,
            },
        ]
    }

    #[tokio::test]
    async fn wrong_network_blocks_every_call() {
        let _ = env_logger::try_init();
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        let admin = dispatcher(&ledger, Some(ADMIN));

        for network_id in [Some(1), None] {
            ledger.set_network_id(network_id);
            for call in all_calls() {
                assert!(matches!(
                    admin.submit(call).await,
                    Err(SdkError::NetworkMismatch {
                        expected: SEPOLIA_NETWORK_ID,
                        actual
                    }) if actual == network_id
                ));
            }
        }
        assert!(ledger.submissions().is_empty());
        assert!(admin.reader().latest().is_none());
    }

    #[tokio::test]
    async fn admin_calls_need_admin() {
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        let voter = dispatcher(&ledger, Some(VOTER));

        for call in all_calls().into_iter().filter(LedgerCall::requires_admin) {
            assert!(matches!(
                voter.submit(call).await,
                Err(SdkError::Unauthorized { account }) if account == VOTER
            ));
        }
        assert!(ledger.submissions().is_empty());

        let anonymous = dispatcher(&ledger, None);
        assert!(matches!(
            anonymous.vote(1).await,
            Err(SdkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn success_refreshes_and_clears_announcement() {
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        let admin = dispatcher(&ledger, Some(ADMIN));
        *admin.announcement.lock() = Some(Announcement {
            election_id: 0,
            winners: crate::winner::Winners {
                max_votes: 1,
                candidates: vec![],
            },
        });

        let receipt = admin.start_election(600).await.unwrap();
        assert!(receipt.success);
        assert!(admin.announcement.lock().is_none());

        admin.register_candidate("alice", "", None).await.unwrap();
        let snapshot = admin.reader().latest().unwrap();
        assert_eq!(snapshot.election_id, 1);
        assert!(snapshot.active);
        assert_eq!(snapshot.candidates[0].name, "alice");
    }

    #[tokio::test]
    async fn declined_signature_changes_nothing() {
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        let admin = dispatcher(&ledger, Some(ADMIN));
        admin.start_election(600).await.unwrap();
        let before = admin.reader().latest();

        ledger.decline_signatures(1);
        assert!(matches!(
            admin.stop_voting().await,
            Err(SdkError::SubmissionRejected(reason)) if reason == "user rejected the request"
        ));
        assert_eq!(admin.reader().latest(), before);
        assert!(admin.reader().latest().unwrap().active);
    }

    #[tokio::test]
    async fn revert_reason_is_verbatim() {
        let ledger = Arc::new(LocalLedger::new(ADMIN));
        let admin = dispatcher(&ledger, Some(ADMIN));
        let voter = dispatcher(&ledger, Some(VOTER));
        admin.start_election(600).await.unwrap();
        admin.register_candidate("alice", "", None).await.unwrap();

        voter.vote(1).await.unwrap();
        assert!(voter.reader().latest().unwrap().has_voted);
        assert!(matches!(
            voter.vote(1).await,
            Err(SdkError::SubmissionReverted(reason)) if reason == "Already voted"
        ));

        // mined but reverted
        ledger.revert_registration(1);
        assert!(matches!(
            admin.register_candidate("bob", "", None).await,
            Err(SdkError::SubmissionReverted(reason)) if reason == "execution reverted"
        ));
    }
}
