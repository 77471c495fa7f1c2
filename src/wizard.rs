//! Multi-step election creation
//!
//! Creating an election takes one ledger call for the election and one per candidate. Calls
//! that were mined cannot be rolled back so a failed commit reports exactly how far it got.

use chrono::NaiveDateTime;
use log::{error, info, warn};

use crate::{
    asset_host::{self, upload_optional, AssetHost, LocalImage},
    dispatcher::ActionDispatcher,
    types::{SdkError, SdkResult},
    utils::{parse_schedule_time, schedule_duration},
    LedgerProvider, NetworkProvider,
};

const LOG_TARGET: &str = "wizard";
const SCHEDULE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Election name and schedule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionMetadata {
    pub name: String,
    pub description: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ElectionMetadata {
    /// `start` and `end` are local timestamps e.g. `2025-01-01T10:00`
    pub fn new(name: &str, description: &str, start: &str, end: &str) -> SdkResult<Self> {
        let metadata = Self {
            name: name.trim().to_string(),
            description: description.to_string(),
            start: parse_schedule_time(start)?,
            end: parse_schedule_time(end)?,
        };
        metadata.duration()?;

        Ok(metadata)
    }
    /// Election length in seconds
    ///
    /// Fails unless the name is set and `end` is after `start`
    pub fn duration(&self) -> SdkResult<u64> {
        if self.name.trim().is_empty() {
            return Err(SdkError::InvalidDraft("election name is required"));
        }
        let seconds = schedule_duration(&self.start, &self.end);
        if seconds <= 0 {
            return Err(SdkError::InvalidSchedule {
                start: self.start.format(SCHEDULE_FORMAT).to_string(),
                end: self.end.format(SCHEDULE_FORMAT).to_string(),
            });
        }
        Ok(seconds as u64)
    }
}

/// A candidate waiting to be registered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DraftCandidate {
    pub name: String,
    pub description: String,
    pub image: Option<LocalImage>,
}

impl DraftCandidate {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            description: description.to_string(),
            image: None,
        }
    }
    /// Attach a photo
    pub fn image(mut self, image: LocalImage) -> Self {
        self.image = Some(image);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// registration mined, `upload_failure` is set if the image was dropped
    Committed {
        image_url: Option<String>,
        upload_failure: Option<String>,
    },
    Failed {
        reason: String,
    },
    NotAttempted,
}

/// Outcome of registering one draft
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepRecord {
    /// 1-based position in the draft roster
    pub position: usize,
    pub name: String,
    pub outcome: StepOutcome,
}

/// Ordered outcome of a wizard commit, one step per draft
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WizardReport {
    /// election the candidates were registered to, if it could be read back
    pub election_id: Option<u64>,
    pub steps: Vec<StepRecord>,
}

impl WizardReport {
    pub fn committed(&self) -> Vec<&StepRecord> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Committed { .. }))
            .collect()
    }
    pub fn failed(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }
    pub fn not_attempted(&self) -> Vec<&StepRecord> {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::NotAttempted)
            .collect()
    }
    /// True if every draft was registered
    pub fn is_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.outcome, StepOutcome::Committed { .. }))
    }
}

/// Collects an election draft and commits it to the ledger
#[derive(Debug, Default)]
pub struct ElectionWizard {
    metadata: Option<ElectionMetadata>,
    drafts: Vec<DraftCandidate>,
}

impl ElectionWizard {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_metadata(&mut self, metadata: ElectionMetadata) {
        self.metadata = Some(metadata);
    }
    pub fn metadata(&self) -> Option<&ElectionMetadata> {
        self.metadata.as_ref()
    }
    /// Append a draft, returning its 1-based position
    pub fn add_candidate(&mut self, draft: DraftCandidate) -> SdkResult<usize> {
        if draft.name.is_empty() {
            return Err(SdkError::InvalidDraft("candidate name is required"));
        }
        if let Some(image) = draft.image.as_ref() {
            asset_host::check_size(image.bytes.len())?;
        }
        self.drafts.push(draft);
        Ok(self.drafts.len())
    }
    /// Remove the draft at 1-based `position`
    pub fn remove_candidate(&mut self, position: usize) -> Option<DraftCandidate> {
        if position == 0 || position > self.drafts.len() {
            return None;
        }
        Some(self.drafts.remove(position - 1))
    }
    pub fn drafts(&self) -> &[DraftCandidate] {
        &self.drafts
    }
    /// Start the election then register each draft in order
    ///
    /// An image that fails to upload is dropped and registration goes ahead without it. The
    /// first failed registration stops the commit with `WizardPartialFailure`, the started
    /// election and any registered candidates stay on the ledger.
    pub async fn commit<L: LedgerProvider, N: NetworkProvider>(
        &self,
        dispatcher: &ActionDispatcher<L, N>,
        asset_host: Option<&dyn AssetHost>,
    ) -> SdkResult<WizardReport> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or(SdkError::InvalidDraft("election metadata is required"))?;
        if self.drafts.is_empty() {
            return Err(SdkError::InvalidDraft("at least one candidate is required"));
        }
        // fields are public, so the schedule is checked again here
        let duration = metadata.duration()?;

        info!(
            target: LOG_TARGET,
            "creating '{}' ({duration}s) with {} candidates",
            metadata.name,
            self.drafts.len()
        );
        dispatcher.start_election(duration).await?;

        let reader = dispatcher.reader();
        let election_id = if reader.is_stale() {
            None
        } else {
            reader.latest().map(|s| s.election_id)
        };
        let mut report = WizardReport {
            election_id,
            steps: self
                .drafts
                .iter()
                .enumerate()
                .map(|(index, draft)| StepRecord {
                    position: index + 1,
                    name: draft.name.clone(),
                    outcome: StepOutcome::NotAttempted,
                })
                .collect(),
        };

        for (index, draft) in self.drafts.iter().enumerate() {
            let (image_url, upload_failure) =
                match upload_optional(asset_host, draft.image.as_ref()).await {
                    Ok(url) => (url, None),
                    Err(err) => {
                        warn!(target: LOG_TARGET, "registering {} without image: {err}", draft.name);
                        (None, Some(err.to_string()))
                    }
                };

            match dispatcher
                .register_candidate(&draft.name, &draft.description, image_url.clone())
                .await
            {
                Ok(_) => {
                    report.steps[index].outcome = StepOutcome::Committed {
                        image_url,
                        upload_failure,
                    };
                }
                Err(err) => {
                    error!(
                        target: LOG_TARGET,
                        "registering candidate {} ({}) failed: {err}",
                        index + 1,
                        draft.name
                    );
                    report.steps[index].outcome = StepOutcome::Failed {
                        reason: err.to_string(),
                    };
                    return Err(SdkError::WizardPartialFailure(Box::new(report)));
                }
            }
        }

        info!(target: LOG_TARGET, "'{}' created", metadata.name);
        Ok(report)
    }
}
