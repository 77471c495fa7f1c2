use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::wizard::WizardReport;

pub type SdkResult<T> = Result<T, SdkError>;

/// 20-byte ledger account address
///
/// Parsing accepts upper/lower/mixed case hex so comparisons are case-insensitive
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Self = Self([0_u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .trim()
            .strip_prefix("0x")
            .or_else(|| s.trim().strip_prefix("0X"))
            .unwrap_or(s.trim());
        let bytes = hex::decode(digits).map_err(|_| SdkError::InvalidAddress(s.to_string()))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| SdkError::InvalidAddress(s.to_string()))?;

        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Hash of a submitted ledger transaction
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl FromStr for TxHash {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        let bytes = hex::decode(digits)
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .ok_or_else(|| SdkError::Transport(format!("invalid transaction hash: {s}")))?;

        Ok(Self(bytes))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A candidate record as stored by the ledger
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Candidate {
    /// 1-based, assigned in registration order within an election
    pub id: u64,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub vote_count: u64,
}

/// Time window of an election in unix seconds
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ElectionWindow {
    pub start_time: u64,
    pub end_time: u64,
    /// seconds remaining as computed by the ledger at query time
    pub remaining: u64,
}

/// Mutating calls accepted by the election ledger
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerCall {
    Vote {
        candidate_id: u64,
    },
    /// Open a new election lasting `duration` seconds from the time it is mined
    StartElection {
        duration: u64,
    },
    StopVoting,
    ExtendElection {
        added: u64,
    },
    RegisterCandidate {
        name: String,
        description: String,
        image_url: Option<String>,
    },
}

impl LedgerCall {
    /// Name of the call for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Vote { .. } => "vote",
            Self::StartElection { .. } => "startNewElection",
            Self::StopVoting => "stopVoting",
            Self::ExtendElection { .. } => "extendElection",
            Self::RegisterCandidate { .. } => "registerCandidate",
        }
    }
    /// Every call except `vote` is reserved to the election admin
    pub fn requires_admin(&self) -> bool {
        !matches!(self, Self::Vote { .. })
    }
}

/// Change notifications emitted by the ledger
///
/// Payloads are informational only, consumers must re-read ledger state rather than apply them
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    ElectionStarted {
        election_id: u64,
    },
    ElectionStopped {
        election_id: u64,
    },
    ElectionExtended {
        election_id: u64,
        end_time: u64,
    },
    CandidateRegistered {
        election_id: u64,
        name: String,
    },
    VoteCast {
        election_id: u64,
        voter: Address,
        candidate_id: u64,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ElectionStarted { .. } => "ElectionStarted",
            Self::ElectionStopped { .. } => "ElectionStopped",
            Self::ElectionExtended { .. } => "ElectionExtended",
            Self::CandidateRegistered { .. } => "CandidateRegistered",
            Self::VoteCast { .. } => "VoteCasted",
        }
    }
}

/// Outcome of a mined transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx: TxHash,
    pub success: bool,
    pub revert_reason: Option<String>,
}

/// Notifications from the wallet, either means the session must be rebuilt from scratch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged,
    NetworkChanged,
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("http fail")]
    Http(#[from] reqwest::Error),
    #[error("json fail")]
    Json(#[from] serde_json::Error),
    #[error("io fail")]
    Io(#[from] std::io::Error),
    #[error("abi: {0}")]
    Abi(#[from] ethabi::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("wrong network: expected {expected}, connected to {actual:?}")]
    NetworkMismatch { expected: u64, actual: Option<u64> },
    #[error("ledger read failed: {0}")]
    ReadFailure(String),
    #[error("election changed mid-read: started at {started}, observed {observed}")]
    InconsistentRead { started: u64, observed: u64 },
    #[error("stale read: {0}")]
    StaleRead(String),
    #[error("no account connected")]
    NotConnected,
    #[error("{account} is not the election admin")]
    Unauthorized { account: Address },
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),
    #[error("submission reverted: {0}")]
    SubmissionReverted(String),
    #[error("image upload failed: {0}")]
    UploadFailure(String),
    #[error("end time must be after start time ({start} -> {end})")]
    InvalidSchedule { start: String, end: String },
    #[error("invalid draft: {0}")]
    InvalidDraft(&'static str),
    #[error("image is {size} bytes, limit is {limit}")]
    ImageTooLarge { size: usize, limit: usize },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown election: {0}")]
    UnknownElection(u64),
    #[error("wizard stopped after partial commit")]
    WizardPartialFailure(Box<WizardReport>),
}
