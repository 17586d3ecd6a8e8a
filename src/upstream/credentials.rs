use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error};

use crate::utils::mask_key;

// Quota assumed for a key we never heard back about. Hypixel grants 300 calls per 5 minutes
// to production keys, development keys get less; the first response overwrites it anyway.
const DEFAULT_KEY_LIMIT: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: Option<DateTime<Utc>>,
    // Whether a response was ever received for this key.
    pub used: bool,
}

/// Upstream API key and its last known quota.
#[derive(Debug)]
pub struct Credential {
    key: String,
    quota: Mutex<Quota>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub key: String,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: Option<DateTime<Utc>>,
    pub used: bool,
}

impl Credential {
    pub fn new(key: String) -> Self {
        Self::with_quota(
            key,
            Quota {
                remaining: DEFAULT_KEY_LIMIT,
                limit: DEFAULT_KEY_LIMIT,
                reset_at: None,
                used: false,
            },
        )
    }

    pub fn with_quota(key: String, quota: Quota) -> Self {
        Credential {
            key,
            quota: Mutex::new(quota),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn quota(&self) -> Quota {
        *self.lock_quota()
    }

    fn lock_quota(&self) -> std::sync::MutexGuard<'_, Quota> {
        // A poisoned quota is still a valid quota, the writer only stores plain numbers.
        self.quota.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pool of API keys shared by every upstream request.
///
/// Only the first `subset_size` keys are considered at each selection, the remaining keys are
/// promoted when a key of the active subset gets revoked.
pub struct CredentialPool {
    credentials: RwLock<Vec<Arc<Credential>>>,
    subset_size: usize,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, subset_size: usize) -> Self {
        let credentials = keys
            .into_iter()
            .map(|key| Arc::new(Credential::new(key)))
            .collect();
        Self::from_credentials(credentials, subset_size)
    }

    pub fn from_credentials(credentials: Vec<Arc<Credential>>, subset_size: usize) -> Self {
        CredentialPool {
            credentials: RwLock::new(credentials),
            subset_size: subset_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn choose_key(&self) -> Option<Arc<Credential>> {
        self.choose_key_at(Utc::now())
    }

    /// Pick the key to use for the next request.
    ///
    /// A key that never served a request wins. Otherwise every key whose reset time has passed
    /// gets its quota restored, and the key with the most remaining calls is chosen (randomly
    /// among equals, to spread concurrent requests over the pool).
    pub fn choose_key_at(&self, now: DateTime<Utc>) -> Option<Arc<Credential>> {
        let subset = self
            .read()
            .iter()
            .take(self.subset_size)
            .cloned()
            .collect::<Vec<_>>();

        if let Some(fresh) = subset.iter().find(|c| !c.lock_quota().used) {
            return Some(fresh.clone());
        }

        let mut best: Vec<(Arc<Credential>, u32)> = vec![];
        for credential in subset.iter() {
            let mut quota = credential.lock_quota();
            if let Some(reset_at) = quota.reset_at {
                if reset_at <= now {
                    quota.remaining = quota.limit;
                    quota.reset_at = None;
                }
            }
            match best.first().map(|(_, remaining)| *remaining) {
                Some(top) if quota.remaining < top => {}
                Some(top) if quota.remaining == top => best.push((credential.clone(), top)),
                _ => best = vec![(credential.clone(), quota.remaining)],
            }
        }

        let chosen = best
            .choose(&mut rand::thread_rng())
            .map(|(credential, _)| credential.clone())?;

        // Reserve the call right away so concurrent selections see the decreased quota.
        {
            let mut quota = chosen.lock_quota();
            quota.remaining = quota.remaining.saturating_sub(1);
        }
        debug!("Selected API key {}", mask_key(chosen.key()));
        Some(chosen)
    }

    /// Store the quota reported by the `ratelimit-*` headers of a response.
    pub fn record_response(
        &self,
        credential: &Credential,
        limit: Option<u32>,
        remaining: Option<u32>,
        reset_in_sec: Option<i64>,
    ) {
        self.record_response_at(credential, limit, remaining, reset_in_sec, Utc::now())
    }

    pub fn record_response_at(
        &self,
        credential: &Credential,
        limit: Option<u32>,
        remaining: Option<u32>,
        reset_in_sec: Option<i64>,
        now: DateTime<Utc>,
    ) {
        let mut quota = credential.lock_quota();
        quota.used = true;
        if let Some(limit) = limit {
            quota.limit = limit;
        }
        if let Some(remaining) = remaining {
            quota.remaining = remaining;
        }
        if let Some(reset) = reset_in_sec {
            quota.reset_at = Some(now + Duration::seconds(reset));
        }
    }

    /// Mark the key as having no call left until its reset time.
    pub fn exhaust(&self, credential: &Credential, cooldown: std::time::Duration) {
        let mut quota = credential.lock_quota();
        quota.used = true;
        quota.remaining = 0;
        if quota.reset_at.is_none() {
            quota.reset_at =
                Some(Utc::now() + Duration::from_std(cooldown).unwrap_or(Duration::seconds(10)));
        }
    }

    /// Drop a key upstream reported as invalid. It is never used again by this process.
    pub fn remove(&self, credential: &Credential) {
        let mut credentials = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = credentials.len();
        credentials.retain(|c| c.key() != credential.key());
        if credentials.len() < before {
            error!(
                "Removed invalid API key {}, {} key(s) left",
                mask_key(credential.key()),
                credentials.len()
            );
        }
    }

    pub fn status(&self) -> Vec<CredentialStatus> {
        self.read()
            .iter()
            .map(|c| {
                let quota = c.quota();
                CredentialStatus {
                    key: mask_key(c.key()),
                    remaining: quota.remaining,
                    limit: quota.limit,
                    reset_at: quota.reset_at,
                    used: quota.used,
                }
            })
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Credential>>> {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
