//! Election contract over Ethereum JSON-RPC
//!
//! Reads go through `eth_call`, mutations through the node's wallet (`eth_sendTransaction`) and
//! notifications are found by polling `eth_getLogs`.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use ethabi::{Contract, ParamType, RawLog, Token, Uint};
use fnv::FnvHashMap;
use futures_util::{
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Interval, MissedTickBehavior};

use crate::{
    constants::DEFAULT_POLL_INTERVAL,
    network::JsonRpcClient,
    types::{
        Address, Candidate, ElectionWindow, LedgerCall, LedgerEvent, Receipt, SdkError, SdkResult,
        TxHash,
    },
    utils::parse_hex_quantity,
    LedgerProvider,
};

const LOG_TARGET: &str = "ledger";

const ELECTION_ABI: &str = include_str!("../res/election_abi.json");

/// selector of `Error(string)`, the payload of a revert with a reason
const REVERT_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Decode the reason of a revert from hex encoded return data
pub fn revert_reason(data: &str) -> Option<String> {
    let data = decode_hex(data).ok()?;
    if data.len() < 4 || data[..4] != REVERT_SELECTOR {
        return None;
    }
    ethabi::decode(&[ParamType::String], &data[4..])
        .ok()?
        .pop()?
        .into_string()
}

fn decode_hex(value: &str) -> SdkResult<Vec<u8>> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).map_err(|_| SdkError::Transport(format!("invalid hex data: {value}")))
}

fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn quantity(value: u64) -> String {
    format!("{value:#x}")
}

/// Typed access to decoded return values, in declaration order
struct Outputs(std::vec::IntoIter<Token>);

impl Outputs {
    fn next<T>(&mut self, kind: &str, convert: impl FnOnce(Token) -> Option<T>) -> SdkResult<T> {
        self.0
            .next()
            .and_then(convert)
            .ok_or_else(|| SdkError::Transport(format!("expected {kind} in contract output")))
    }
    fn uint(&mut self) -> SdkResult<u64> {
        let value = self.next("uint256", Token::into_uint)?;
        if value > Uint::from(u64::MAX) {
            return Err(SdkError::Transport(format!("{value} does not fit in u64")));
        }
        Ok(value.low_u64())
    }
    fn bool(&mut self) -> SdkResult<bool> {
        self.next("bool", Token::into_bool)
    }
    fn address(&mut self) -> SdkResult<Address> {
        self.next("address", Token::into_address)
            .map(|address| Address::new(address.0))
    }
    fn string(&mut self) -> SdkResult<String> {
        self.next("string", Token::into_string)
    }
}

fn candidate(mut out: Outputs) -> SdkResult<Candidate> {
    Ok(Candidate {
        id: out.uint()?,
        name: out.string()?,
        description: out.string()?,
        image_url: Some(out.string()?).filter(|url| !url.is_empty()),
        vote_count: out.uint()?,
    })
}

fn election_window(mut out: Outputs) -> SdkResult<ElectionWindow> {
    Ok(ElectionWindow {
        start_time: out.uint()?,
        end_time: out.uint()?,
        remaining: out.uint()?,
    })
}

fn uint(value: u64) -> Token {
    Token::Uint(Uint::from(value))
}

/// ABI of the election contract
pub struct LedgerAbi {
    contract: Contract,
}

impl LedgerAbi {
    pub fn load() -> SdkResult<Self> {
        Ok(Self {
            contract: Contract::load(ELECTION_ABI.as_bytes())?,
        })
    }
    /// Calldata of a mutating call
    pub fn encode_call(&self, call: &LedgerCall) -> SdkResult<Vec<u8>> {
        let args = match call {
            LedgerCall::Vote { candidate_id } => vec![uint(*candidate_id)],
            LedgerCall::StartElection { duration } => vec![uint(*duration)],
            LedgerCall::StopVoting => vec![],
            LedgerCall::ExtendElection { added } => vec![uint(*added)],
            LedgerCall::RegisterCandidate {
                name,
                description,
                image_url,
            } => vec![
                Token::String(name.clone()),
                Token::String(description.clone()),
                Token::String(image_url.clone().unwrap_or_default()),
            ],
        };
        self.encode(call.name(), &args)
    }

    fn encode(&self, function: &str, args: &[Token]) -> SdkResult<Vec<u8>> {
        Ok(self.contract.function(function)?.encode_input(args)?)
    }

    fn decode(&self, function: &str, data: &[u8]) -> SdkResult<Outputs> {
        let tokens = self.contract.function(function)?.decode_output(data)?;
        Ok(Outputs(tokens.into_iter()))
    }

    /// Decode a contract log, `None` if it is not an election event
    fn decode_log(&self, log: &RpcLog) -> SdkResult<Option<LedgerEvent>> {
        let topics = log
            .topics
            .iter()
            .map(|topic| -> SdkResult<ethabi::Hash> {
                let bytes = <[u8; 32]>::try_from(decode_hex(topic)?)
                    .map_err(|_| SdkError::Transport(format!("invalid topic: {topic}")))?;
                Ok(ethabi::Hash::from(bytes))
            })
            .collect::<SdkResult<Vec<_>>>()?;
        let signature = match topics.first() {
            Some(signature) => *signature,
            None => return Ok(None),
        };
        let event = match self
            .contract
            .events()
            .find(|event| event.signature() == signature)
        {
            Some(event) => event,
            None => return Ok(None),
        };

        let parsed = event.parse_log(RawLog {
            topics,
            data: decode_hex(&log.data)?,
        })?;
        let mut out = Outputs(
            parsed
                .params
                .into_iter()
                .map(|param| param.value)
                .collect::<Vec<_>>()
                .into_iter(),
        );
        let election_id = out.uint()?;
        let event = match event.name.as_str() {
            "ElectionStarted" => LedgerEvent::ElectionStarted { election_id },
            "ElectionStopped" => LedgerEvent::ElectionStopped { election_id },
            "ElectionExtended" => LedgerEvent::ElectionExtended {
                election_id,
                end_time: out.uint()?,
            },
            "CandidateRegistered" => LedgerEvent::CandidateRegistered {
                election_id,
                name: out.string()?,
            },
            "VoteCasted" => LedgerEvent::VoteCast {
                election_id,
                voter: out.address()?,
                candidate_id: out.uint()?,
            },
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    /// `0x1` success, `0x0` reverted, absent before byzantium
    status: Option<String>,
    block_number: Option<String>,
}

#[derive(Deserialize)]
struct RpcLog {
    topics: Vec<String>,
    data: String,
    /// set for logs of a block dropped by a reorg
    #[serde(default)]
    removed: bool,
}

async fn block_number(rpc: &JsonRpcClient) -> SdkResult<u64> {
    let number: String = rpc.call("eth_blockNumber", json!([])).await?;
    parse_hex_quantity(&number)
        .ok_or_else(|| SdkError::Transport(format!("invalid block number: {number}")))
}

/// Election ledger reached through a node's JSON-RPC API
///
/// Transactions are signed by the node (or an injected wallet) for the `from` account.
pub struct RpcLedgerProvider {
    rpc: Arc<JsonRpcClient>,
    abi: Arc<LedgerAbi>,
    contract: Address,
    poll_interval: Duration,
    /// submitted calls awaiting a receipt, replayed to recover the reason of a revert
    pending: Mutex<FnvHashMap<TxHash, (Address, Vec<u8>)>>,
}

impl RpcLedgerProvider {
    pub fn new(rpc: Arc<JsonRpcClient>, contract: Address) -> SdkResult<Self> {
        info!(target: LOG_TARGET, "election contract {contract} at {}", rpc.url());
        Ok(Self {
            rpc,
            abi: Arc::new(LedgerAbi::load()?),
            contract,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pending: Default::default(),
        })
    }
    /// Set the receipt and log polling period
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn eth_call(
        &self,
        from: Option<Address>,
        data: &[u8],
        block: &str,
    ) -> SdkResult<Vec<u8>> {
        let mut request = json!({
            "to": self.contract.to_string(),
            "data": encode_hex(data),
        });
        if let Some(from) = from {
            request["from"] = json!(from.to_string());
        }
        let output: String = self.rpc.call("eth_call", json!([request, block])).await?;
        decode_hex(&output)
    }

    async fn read(&self, function: &str, args: &[Token]) -> SdkResult<Outputs> {
        let data = self.abi.encode(function, args)?;
        let output = self.eth_call(None, &data, "latest").await?;
        self.abi.decode(function, &output)
    }

    async fn admin_impl(&self) -> SdkResult<Address> {
        self.read("admin", &[]).await?.address()
    }

    async fn voting_active_impl(&self) -> SdkResult<bool> {
        self.read("votingActive", &[]).await?.bool()
    }

    async fn current_election_id_impl(&self) -> SdkResult<u64> {
        self.read("currentElectionId", &[]).await?.uint()
    }

    async fn election_window_impl(&self, election_id: u64) -> SdkResult<ElectionWindow> {
        election_window(self.read("getElectionTime", &[uint(election_id)]).await?)
    }

    async fn candidates_count_impl(&self, election_id: u64) -> SdkResult<u64> {
        self.read("candidatesCount", &[uint(election_id)])
            .await?
            .uint()
    }

    async fn candidate_impl(&self, election_id: u64, candidate_id: u64) -> SdkResult<Candidate> {
        candidate(
            self.read("candidates", &[uint(election_id), uint(candidate_id)])
                .await?,
        )
    }

    async fn has_voted_impl(&self, election_id: u64, voter: Address) -> SdkResult<bool> {
        let voter = Token::Address(ethabi::Address::from(*voter.as_bytes()));
        self.read("hasVoted", &[uint(election_id), voter])
            .await?
            .bool()
    }

    async fn submit_impl(&self, from: Address, call: LedgerCall) -> SdkResult<TxHash> {
        let data = self.abi.encode_call(&call)?;
        let tx: String = self
            .rpc
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": from.to_string(),
                    "to": self.contract.to_string(),
                    "data": encode_hex(&data),
                }]),
            )
            .await?;
        let tx: TxHash = tx.parse()?;
        debug!(target: LOG_TARGET, "{} from {from} sent: {tx}", call.name());
        self.pending.lock().insert(tx, (from, data));

        Ok(tx)
    }

    async fn confirm_impl(&self, tx: TxHash) -> SdkResult<Receipt> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let receipt = loop {
            interval.tick().await;
            let receipt: Option<RpcReceipt> = self
                .rpc
                .call_nullable("eth_getTransactionReceipt", json!([tx.to_string()]))
                .await?;
            match receipt {
                Some(receipt) => break receipt,
                None => debug!(target: LOG_TARGET, "{tx} not mined yet"),
            }
        };
        let pending = self.pending.lock().remove(&tx);

        let success = receipt
            .status
            .as_deref()
            .map_or(true, |status| parse_hex_quantity(status) == Some(1));
        if success {
            return Ok(Receipt {
                tx,
                success,
                revert_reason: None,
            });
        }

        // receipts carry no reason, replaying the call at its block does
        let block = receipt.block_number.as_deref().unwrap_or("latest");
        let revert_reason = match pending {
            Some((from, data)) => match self.eth_call(Some(from), &data, block).await {
                Err(SdkError::SubmissionReverted(reason)) => Some(reason),
                Err(err) => {
                    warn!(target: LOG_TARGET, "no revert reason for {tx}: {err}");
                    None
                }
                Ok(_) => None,
            },
            None => None,
        };

        Ok(Receipt {
            tx,
            success,
            revert_reason,
        })
    }

    async fn subscribe_impl(&self) -> SdkResult<BoxStream<'static, LedgerEvent>> {
        let head = block_number(&self.rpc).await?;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poller = LogPoller {
            rpc: Arc::clone(&self.rpc),
            abi: Arc::clone(&self.abi),
            contract: self.contract,
            next_block: head + 1,
            interval,
            buffered: VecDeque::new(),
        };
        debug!(target: LOG_TARGET, "polling logs of {} from block {}", self.contract, head + 1);

        Ok(stream::unfold(poller, |mut poller| async move {
            let event = poller.next_event().await?;
            Some((event, poller))
        })
        .boxed())
    }
}

/// Turns `eth_getLogs` polls into a stream of events
struct LogPoller {
    rpc: Arc<JsonRpcClient>,
    abi: Arc<LedgerAbi>,
    contract: Address,
    next_block: u64,
    interval: Interval,
    buffered: VecDeque<LedgerEvent>,
}

impl LogPoller {
    /// Next event, `None` once polling fails
    async fn next_event(&mut self) -> Option<LedgerEvent> {
        loop {
            if let Some(event) = self.buffered.pop_front() {
                return Some(event);
            }
            self.interval.tick().await;
            if let Err(err) = self.poll().await {
                warn!(target: LOG_TARGET, "log polling failed: {err}");
                return None;
            }
        }
    }

    async fn poll(&mut self) -> SdkResult<()> {
        let head = block_number(&self.rpc).await?;
        if head < self.next_block {
            return Ok(());
        }
        let logs: Vec<RpcLog> = self
            .rpc
            .call(
                "eth_getLogs",
                json!([{
                    "address": self.contract.to_string(),
                    "fromBlock": quantity(self.next_block),
                    "toBlock": quantity(head),
                }]),
            )
            .await?;

        for log in logs.iter().filter(|log| !log.removed) {
            match self.abi.decode_log(log) {
                Ok(Some(event)) => self.buffered.push_back(event),
                Ok(None) => debug!(target: LOG_TARGET, "ignoring log {:?}", log.topics.first()),
                Err(err) => warn!(target: LOG_TARGET, "undecodable log: {err}"),
            }
        }
        self.next_block = head + 1;

        Ok(())
    }
}

impl LedgerProvider for RpcLedgerProvider {
    fn admin(&self) -> BoxFuture<SdkResult<Address>> {
        self.admin_impl().boxed()
    }
    fn voting_active(&self) -> BoxFuture<SdkResult<bool>> {
        self.voting_active_impl().boxed()
    }
    fn current_election_id(&self) -> BoxFuture<SdkResult<u64>> {
        self.current_election_id_impl().boxed()
    }
    fn election_window(&self, election_id: u64) -> BoxFuture<SdkResult<ElectionWindow>> {
        self.election_window_impl(election_id).boxed()
    }
    fn candidates_count(&self, election_id: u64) -> BoxFuture<SdkResult<u64>> {
        self.candidates_count_impl(election_id).boxed()
    }
    fn candidate(&self, election_id: u64, candidate_id: u64) -> BoxFuture<SdkResult<Candidate>> {
        self.candidate_impl(election_id, candidate_id).boxed()
    }
    fn has_voted(&self, election_id: u64, voter: Address) -> BoxFuture<SdkResult<bool>> {
        self.has_voted_impl(election_id, voter).boxed()
    }
    fn submit(&self, from: Address, call: LedgerCall) -> BoxFuture<SdkResult<TxHash>> {
        self.submit_impl(from, call).boxed()
    }
    fn confirm(&self, tx: TxHash) -> BoxFuture<SdkResult<Receipt>> {
        self.confirm_impl(tx).boxed()
    }
    fn subscribe_events(&self) -> BoxFuture<SdkResult<BoxStream<'static, LedgerEvent>>> {
        self.subscribe_impl().boxed()
    }
}
