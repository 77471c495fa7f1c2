//! Election SDK
//!
//! Keeps a local view of an on-chain election consistent with the ledger and drives the
//! admin and voter workflows against it.

use std::sync::Arc;

use futures_util::{future::BoxFuture, stream::BoxStream};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

pub mod asset_host;
pub mod async_utils;
pub mod clock;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod event_subscriber;
#[cfg(any(test, feature = "local-ledger"))]
pub mod local_ledger;
pub mod network;
pub mod rpc_ledger;
pub mod state_reader;
pub mod types;
pub mod utils;
pub mod winner;
pub mod wizard;

use crate::{
    asset_host::{upload_optional, AssetHost, ImgbbAssetHost, LocalImage},
    async_utils::retry_policy,
    clock::{ClockHandle, ElectionClock},
    config::ClientConfig,
    dispatcher::ActionDispatcher,
    event_subscriber::{EventSubscriber, LedgerEventStream, Reconciler},
    network::{JsonRpcClient, NetworkGuard, RpcNetworkProvider},
    rpc_ledger::RpcLedgerProvider,
    state_reader::{ElectionResults, LedgerStateReader, Snapshot},
    types::*,
    winner::{resolve_winners, Announcement},
    wizard::{ElectionWizard, WizardReport},
};

const LOG_TARGET: &str = "client";

/// Provides the election contract API
pub trait LedgerProvider: 'static + Send + Sync {
    /// Address allowed to administer elections
    fn admin(&self) -> BoxFuture<SdkResult<Address>>;
    fn voting_active(&self) -> BoxFuture<SdkResult<bool>>;
    /// Id of the current election, 0 if none was started
    fn current_election_id(&self) -> BoxFuture<SdkResult<u64>>;
    fn election_window(&self, election_id: u64) -> BoxFuture<SdkResult<ElectionWindow>>;
    fn candidates_count(&self, election_id: u64) -> BoxFuture<SdkResult<u64>>;
    /// Candidate `candidate_id` (1-based) of `election_id`
    fn candidate(&self, election_id: u64, candidate_id: u64) -> BoxFuture<SdkResult<Candidate>>;
    fn has_voted(&self, election_id: u64, voter: Address) -> BoxFuture<SdkResult<bool>>;
    /// Sign and send `call` from `from`, returning once it is accepted for mining
    fn submit(&self, from: Address, call: LedgerCall) -> BoxFuture<SdkResult<TxHash>>;
    /// Wait for `tx` to be mined
    fn confirm(&self, tx: TxHash) -> BoxFuture<SdkResult<Receipt>>;
    /// Stream of ledger change notifications
    fn subscribe_events(&self) -> BoxFuture<SdkResult<BoxStream<'static, LedgerEvent>>>;
}

/// Provides the wallet's network and accounts
pub trait NetworkProvider: 'static + Send + Sync {
    fn network_id(&self) -> BoxFuture<SdkResult<u64>>;
    /// Connected accounts, the first one acts
    fn accounts(&self) -> BoxFuture<SdkResult<Vec<Address>>>;
}

/// Connection state of the wallet
///
/// Never updated in place, a wallet change produces a new `Session`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub account: Option<Address>,
    /// `None` if the provider could not be reached
    pub network_id: Option<u64>,
    pub on_required_network: bool,
    pub is_admin: bool,
}

/// Shared handle to the current session
pub type SessionHandle = Arc<RwLock<Arc<Session>>>;

/// Election client
///
/// It is intended to be a singleton per wallet connection, it owns the ledger subscription and
/// the current snapshot
pub struct ElectionClient<L: LedgerProvider, N: NetworkProvider> {
    config: ClientConfig,
    ledger: Arc<L>,
    network: Arc<N>,
    guard: NetworkGuard<N>,
    reader: Arc<LedgerStateReader<L>>,
    session: SessionHandle,
    announcement: Arc<Mutex<Option<Announcement>>>,
    dispatcher: ActionDispatcher<L, N>,
    reconciler: Reconciler,
    subscription: Mutex<Option<LedgerEventStream>>,
    asset_host: Option<Arc<dyn AssetHost>>,
}

impl<L: LedgerProvider, N: NetworkProvider> ElectionClient<L, N> {
    /// Connect to the ledger and read the initial snapshot
    ///
    /// A wrong network or an unreachable ledger does not fail the connection, the session and
    /// staleness flag report it
    pub async fn connect(config: ClientConfig, ledger: Arc<L>, network: Arc<N>) -> Self {
        let guard = NetworkGuard::new(Arc::clone(&network), config.required_network_id);
        let reader = Arc::new(LedgerStateReader::new(Arc::clone(&ledger)));
        let session: SessionHandle = Default::default();
        let announcement: Arc<Mutex<Option<Announcement>>> = Default::default();
        let dispatcher = ActionDispatcher::new(
            Arc::clone(&ledger),
            Arc::clone(&reader),
            guard.clone(),
            Arc::clone(&session),
            Arc::clone(&announcement),
        );
        let reconciler = {
            let reader = Arc::clone(&reader);
            let session = Arc::clone(&session);
            Reconciler::spawn(move || {
                let reader = Arc::clone(&reader);
                let account = session.read().account;
                async move {
                    // failures are logged and flag the reader stale
                    let _ = reader.refresh(account).await;
                }
            })
        };
        let asset_host = config.asset_host.as_ref().map(|host| {
            Arc::new(ImgbbAssetHost::new(&host.endpoint, &host.api_key)) as Arc<dyn AssetHost>
        });

        let client = Self {
            config,
            ledger,
            network,
            guard,
            reader,
            session,
            announcement,
            dispatcher,
            reconciler,
            subscription: Mutex::new(None),
            asset_host,
        };
        client.reconnect().await;

        client
    }
    /// Use `asset_host` for candidate images instead of the configured one
    pub fn with_asset_host(mut self, asset_host: Arc<dyn AssetHost>) -> Self {
        self.asset_host = Some(asset_host);
        self
    }
    /// Rebuild the session and ledger subscription from scratch
    pub async fn reconnect(&self) -> Arc<Session> {
        if let Some(stream) = self.subscription.lock().take() {
            debug!(target: LOG_TARGET, "dropping previous subscription");
            stream.unsubscribe();
        }

        let (network_id, on_required_network) = match self.guard.ensure().await {
            Ok(network_id) => (Some(network_id), true),
            Err(SdkError::NetworkMismatch { actual, .. }) => (actual, false),
            Err(err) => {
                warn!(target: LOG_TARGET, "network check failed: {err}");
                (None, false)
            }
        };
        let account = match self.network.accounts().await {
            Ok(accounts) => accounts.first().copied(),
            Err(err) => {
                warn!(target: LOG_TARGET, "accounts unavailable: {err}");
                None
            }
        };
        // refreshes triggered from here on read for the new account
        let is_admin = |snapshot: Option<Arc<Snapshot>>| match (account, snapshot) {
            (Some(account), Some(snapshot)) => snapshot.is_admin(&account),
            _ => false,
        };
        self.replace_session(Session {
            account,
            network_id,
            on_required_network,
            is_admin: is_admin(self.reader.latest()),
        });

        let stream = EventSubscriber::subscribe(
            Arc::clone(&self.ledger),
            self.reconciler.invalidator(),
            retry_policy::exponential_backoff(self.config.subscription_retries)
                .base_delay(self.config.subscription_retry_delay),
        );
        if let Some(previous) = self.subscription.lock().replace(stream) {
            // a concurrent reconnect got here first
            previous.unsubscribe();
        }

        let snapshot = match self.reader.refresh(account).await {
            Ok(snapshot) => Some(snapshot),
            Err(_) => self.reader.latest(),
        };
        let session = self.replace_session(Session {
            account,
            network_id,
            on_required_network,
            is_admin: is_admin(snapshot),
        });
        info!(target: LOG_TARGET, "session: {session:?}");

        session
    }
    /// React to a wallet notification, any change rebuilds the session
    pub async fn handle_wallet_event(&self, event: WalletEvent) -> Arc<Session> {
        info!(target: LOG_TARGET, "wallet event {event:?}, reconnecting");
        self.reconnect().await
    }
    /// End the ledger subscription and forget the account
    pub fn disconnect(&self) {
        if let Some(stream) = self.subscription.lock().take() {
            stream.unsubscribe();
        }
        self.replace_session(Session::default());
        info!(target: LOG_TARGET, "disconnected");
    }
    fn replace_session(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        *self.session.write() = Arc::clone(&session);
        session
    }
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session.read())
    }
    /// Latest consistent snapshot
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.reader.latest()
    }
    /// True if the last refresh failed and the snapshot may be out of date
    pub fn is_stale(&self) -> bool {
        self.reader.is_stale()
    }
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.reader.subscribe()
    }
    /// True if an event subscription is live
    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .map_or(false, |stream| !stream.is_finished())
    }
    /// Request a background refresh
    pub fn invalidate(&self) {
        self.reconciler.invalidate();
    }
    /// Refresh now for the session account
    pub async fn refresh(&self) -> SdkResult<Arc<Snapshot>> {
        let account = self.session.read().account;
        self.reader.refresh(account).await
    }
    /// Start a countdown over the current election
    ///
    /// The clock runs until the handle is dropped
    pub fn start_clock(&self) -> ClockHandle {
        ElectionClock::spawn(self.reader.subscribe(), self.reconciler.invalidator())
    }
    pub fn dispatcher(&self) -> &ActionDispatcher<L, N> {
        &self.dispatcher
    }
    pub async fn vote(&self, candidate_id: u64) -> SdkResult<Receipt> {
        self.dispatcher.vote(candidate_id).await
    }
    pub async fn start_election(&self, duration: u64) -> SdkResult<Receipt> {
        self.dispatcher.start_election(duration).await
    }
    pub async fn stop_voting(&self) -> SdkResult<Receipt> {
        self.dispatcher.stop_voting().await
    }
    pub async fn extend_election(&self, added: u64) -> SdkResult<Receipt> {
        self.dispatcher.extend_election(added).await
    }
    pub async fn register_candidate(
        &self,
        name: &str,
        description: &str,
        image_url: Option<String>,
    ) -> SdkResult<Receipt> {
        self.dispatcher
            .register_candidate(name, description, image_url)
            .await
    }
    /// Upload `image` then register the candidate
    ///
    /// A failed upload registers the candidate without an image
    pub async fn register_candidate_with_image(
        &self,
        name: &str,
        description: &str,
        image: Option<&LocalImage>,
    ) -> SdkResult<Receipt> {
        if name.trim().is_empty() {
            return Err(SdkError::InvalidDraft("candidate name is required"));
        }
        let image_url = match upload_optional(self.asset_host.as_deref(), image).await {
            Ok(url) => url,
            Err(err) => {
                warn!(target: LOG_TARGET, "registering {name} without image: {err}");
                None
            }
        };
        self.dispatcher
            .register_candidate(name.trim(), description, image_url)
            .await
    }
    /// Commit `wizard` through this client
    pub async fn commit_wizard(&self, wizard: &ElectionWizard) -> SdkResult<WizardReport> {
        wizard
            .commit(&self.dispatcher, self.asset_host.as_deref())
            .await
    }
    /// Results of any election up to the current one
    pub async fn election_results(&self, election_id: u64) -> SdkResult<ElectionResults> {
        self.reader.election_results(election_id).await
    }
    /// Announce the winner(s) of the current election once voting closed
    ///
    /// The announcement is kept until the next successful action
    pub fn announce_winner(&self) -> Option<Announcement> {
        let snapshot = self.reader.latest()?;
        if snapshot.active || snapshot.candidates.is_empty() {
            return None;
        }

        let mut announcement = self.announcement.lock();
        match announcement.as_ref() {
            Some(cached) if cached.election_id == snapshot.election_id => Some(cached.clone()),
            _ => {
                let winners = resolve_winners(&snapshot.candidates)?;
                info!(
                    target: LOG_TARGET,
                    "election {} won by {:?} with {} votes",
                    snapshot.election_id,
                    winners.candidates.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    winners.max_votes
                );
                let fresh = Announcement {
                    election_id: snapshot.election_id,
                    winners,
                };
                *announcement = Some(fresh.clone());
                Some(fresh)
            }
        }
    }
}

impl ElectionClient<RpcLedgerProvider, RpcNetworkProvider> {
    /// Connect to the configured contract through the configured JSON-RPC endpoint
    pub async fn connect_rpc(config: ClientConfig) -> SdkResult<Self> {
        let rpc = Arc::new(JsonRpcClient::new(&config.rpc_url));
        let ledger = RpcLedgerProvider::new(Arc::clone(&rpc), config.contract_address)?
            .poll_interval(config.poll_interval);
        let network = RpcNetworkProvider::with_client(rpc);

        Ok(Self::connect(config, Arc::new(ledger), Arc::new(network)).await)
    }
}
