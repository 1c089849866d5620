//! External collaborator interfaces consumed by the harness core.
//!
//! The harness coordinates *when* and *how many* flows run; what a flow
//! actually does lives behind [`FlowDelegate`]. Funding, confirmation lookup
//! and report emission are seams in the same spirit.

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::arrivals::WorkItem;
use crate::pool::{Credential, CredentialId};

/// Early-release signal handed to the delegate.
///
/// Firing it tells the executor that the submission has been acknowledged
/// (e.g. a submission handle came back) while the final confirmation is
/// still pending. Under the aggressive release policy this frees the
/// concurrency slot; under the standard policy it is ignored. A delegate
/// that never fires it simply holds its slot for the full flow duration.
#[derive(Debug)]
pub struct SubmissionAck {
    tx: Option<oneshot::Sender<()>>,
}

impl SubmissionAck {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An ack with nobody listening, for driving delegates directly in tests.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Signals that the submission was acknowledged. Idempotent.
    pub fn submitted(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Successful delegate outcome. Duration is measured by the executor.
#[derive(Debug, Clone, Default)]
pub struct FlowOutcome {
    /// External reference to the submitted work (e.g. a submission hash),
    /// used for confirmation lookup and reporting.
    pub reference: Option<String>,
}

impl FlowOutcome {
    /// Outcome carrying an external reference.
    pub fn with_reference(reference: impl Into<String>) -> Self {
        Self { reference: Some(reference.into()) }
    }
}

/// The business operation under test.
///
/// Errors are either typed [`FlowError`](crate::error::FlowError)s, which
/// pass through the executor untouched, or opaque reports whose description
/// gets classified at the executor boundary.
#[async_trait]
pub trait FlowDelegate: Send + Sync {
    async fn execute(
        &self,
        item: &WorkItem,
        credential: &Credential,
        nonce: Option<u64>,
        ack: SubmissionAck,
    ) -> Result<FlowOutcome>;
}

/// Per-credential funding outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingReceipt {
    pub id: CredentialId,
    pub success: bool,
    pub error: Option<String>,
}

impl FundingReceipt {
    /// A successful receipt.
    pub fn ok(id: CredentialId) -> Self {
        Self { id, success: true, error: None }
    }

    /// A failed receipt with a reason.
    pub fn failed(id: CredentialId, error: impl Into<String>) -> Self {
        Self { id, success: false, error: Some(error.into()) }
    }
}

/// Bulk-funds credentials before the run starts.
#[async_trait]
pub trait FundingAuthority: Send + Sync {
    async fn fund(&self, ids: &[CredentialId]) -> Result<Vec<FundingReceipt>>;
}

/// Post-hoc batching information for one confirmed submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationInfo {
    /// Batch the submission was included in.
    pub batch_id: u64,
    /// Resource the batch consumed.
    pub resource_used: u64,
    /// Resource ceiling of the batch.
    pub resource_limit: u64,
}

/// Optional lookup used only for batching/utilization statistics in the
/// final report; absence of an observer omits that report section.
#[async_trait]
pub trait ConfirmationObserver: Send + Sync {
    async fn confirmation(&self, reference: &str) -> Result<ConfirmationInfo>;
}
