//! Pre-funded ephemeral credential pool.
//!
//! Credentials are generated in bulk, funded through one or more funding
//! authorities before the run starts, and dispensed exactly once. A
//! dispensed credential never returns to the pool, even when its flow fails:
//! reuse would break the sequencing assumptions of whatever shared state the
//! credential authorizes.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use eyre::{eyre, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::delegate::FundingAuthority;
use crate::error::FlowError;

/// Identifier of a pool credential.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CredentialId(pub u64);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cred-{}", self.0)
    }
}

/// Funding lifecycle of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingState {
    Unfunded,
    Funded,
    Exhausted,
}

/// An ephemeral, single-use credential authorizing one flow.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: CredentialId,
    pub funding: FundingState,
    /// Opaque reference to the signing secret backing this credential.
    pub secret_ref: String,
}

impl Credential {
    fn generate(index: u64) -> Self {
        let secret: [u8; 32] = rand::rng().random();
        Self {
            id: CredentialId(index),
            funding: FundingState::Unfunded,
            secret_ref: format!("0x{}", hex::encode(secret)),
        }
    }
}

/// Pool counters. `funded + unfunded + dispensed` always equals `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: u64,
    pub funded: u64,
    pub unfunded: u64,
    pub dispensed: u64,
}

/// Dispenses exclusively owned, pre-funded credentials.
#[derive(Debug)]
pub struct CredentialPool {
    available: Mutex<VecDeque<Credential>>,
    total: u64,
    unfunded: u64,
    dispensed: AtomicU64,
    low_watermark: u64,
    watermark_warned: AtomicBool,
}

impl CredentialPool {
    /// Generates `target_population + buffer_size` fresh credentials and
    /// funds them in parallel batches across the given authorities before
    /// returning. Credentials still unfunded after the configured retries
    /// stay excluded from availability; funding nothing at all is fatal.
    pub async fn initialize(
        config: &PoolConfig,
        funders: &[Arc<dyn FundingAuthority>],
    ) -> Result<Self> {
        if funders.is_empty() {
            return Err(eyre!("at least one funding authority is required"));
        }

        let count = config.pool_size();
        let mut credentials: Vec<Credential> =
            (0..count).map(Credential::generate).collect();

        // round-robin split so every authority funds an even share
        let mut batches: Vec<Vec<CredentialId>> = vec![Vec::new(); funders.len()];
        for (i, credential) in credentials.iter().enumerate() {
            batches[i % funders.len()].push(credential.id);
        }

        let mut tasks = JoinSet::new();
        for (slot, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let funder = Arc::clone(&funders[slot]);
            let retries = config.funding_retries;
            tasks.spawn(async move { fund_batch(funder, batch, retries).await });
        }

        let mut funded_ids: HashSet<CredentialId> = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ids) => funded_ids.extend(ids),
                Err(err) => warn!(error = %err, "funding task aborted"),
            }
        }

        let mut available = VecDeque::with_capacity(funded_ids.len());
        let mut unfunded = 0u64;
        for credential in credentials.drain(..) {
            if funded_ids.contains(&credential.id) {
                available.push_back(Credential { funding: FundingState::Funded, ..credential });
            } else {
                unfunded += 1;
            }
        }

        if available.is_empty() {
            return Err(eyre!("funding failed for all {count} credentials"));
        }
        if unfunded > 0 {
            warn!(unfunded, funded = available.len(), "pool partially funded");
        }
        info!(funded = available.len(), unfunded, total = count, "credential pool ready");

        Ok(Self {
            available: Mutex::new(available),
            total: count,
            unfunded,
            dispensed: AtomicU64::new(0),
            low_watermark: config.low_watermark,
            watermark_warned: AtomicBool::new(false),
        })
    }

    /// Dispenses an exclusively owned credential, or fails when none remain.
    pub fn get(&self) -> Result<Credential, FlowError> {
        let mut available = self.available.lock().expect("pool lock poisoned");
        let credential = available.pop_front().ok_or(FlowError::PoolExhausted)?;
        self.dispensed.fetch_add(1, Ordering::Relaxed);

        let remaining = available.len() as u64;
        drop(available);
        if remaining < self.low_watermark && !self.watermark_warned.swap(true, Ordering::Relaxed)
        {
            warn!(remaining, watermark = self.low_watermark, "credential pool running low");
        }
        debug!(id = %credential.id, remaining, "credential dispensed");
        Ok(credential)
    }

    /// Current pool counters.
    pub fn stats(&self) -> PoolStats {
        let funded = self.available.lock().expect("pool lock poisoned").len() as u64;
        PoolStats {
            total: self.total,
            funded,
            unfunded: self.unfunded,
            dispensed: self.dispensed.load(Ordering::Relaxed),
        }
    }
}

/// Funds one batch through one authority, retrying the still-unfunded
/// remainder a bounded number of times. Returns the ids that funded.
async fn fund_batch(
    funder: Arc<dyn FundingAuthority>,
    batch: Vec<CredentialId>,
    retries: u32,
) -> HashSet<CredentialId> {
    let mut funded = HashSet::new();
    let mut pending = batch;

    for attempt in 0..=retries {
        if pending.is_empty() {
            break;
        }
        let requested: HashSet<CredentialId> = pending.iter().copied().collect();
        let succeeded: HashSet<CredentialId> = match funder.fund(&pending).await {
            Ok(receipts) => receipts
                .into_iter()
                .filter_map(|receipt| {
                    if receipt.success {
                        Some(receipt.id)
                    } else {
                        debug!(id = %receipt.id, error = ?receipt.error, "funding declined");
                        None
                    }
                })
                .collect(),
            Err(err) => {
                debug!(error = %err, attempt, "funding call failed");
                HashSet::new()
            }
        };

        funded.extend(succeeded.iter().copied());
        pending = requested.difference(&succeeded).copied().collect();
        if !pending.is_empty() && attempt < retries {
            debug!(attempt, remaining = pending.len(), "retrying funding batch");
        }
    }

    if !pending.is_empty() {
        warn!(count = pending.len(), "credentials unfunded after retries");
    }
    funded
}
