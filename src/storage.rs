use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use crate::error::{StatsError, StatsResult};
use crate::items::{AuctionRecord, IdentityKey, ItemIdentity};
use crate::leaderboard::SubjectKind;

/// One persisted leaderboard document: the qualifying attributes of a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRecord {
    pub subject_id: String,
    pub group_id: String,
    pub username: Option<String>,
    pub stats: BTreeMap<String, f64>,
    pub updated_at: DateTime<Utc>,
}

/// A single ranked value, as held by leaderboard windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub subject_id: String,
    pub group_id: String,
    pub username: Option<String>,
    pub value: f64,
}

impl LeaderboardEntry {
    pub fn is_subject(&self, subject_id: &str, group_id: &str) -> bool {
        self.subject_id == subject_id && self.group_id == group_id
    }
}

/// Persistent document store behind leaderboards, item identities and auctions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_leaderboard_record(
        &self,
        kind: SubjectKind,
        subject_id: &str,
        group_id: &str,
    ) -> StatsResult<Option<LeaderboardRecord>>;

    /// Keyed by subject and group. The stats of the record replace the stored ones,
    /// a record without any stat is deleted.
    async fn upsert_leaderboard_record(
        &self,
        kind: SubjectKind,
        record: LeaderboardRecord,
    ) -> StatsResult<()>;

    async fn find_top(
        &self,
        kind: SubjectKind,
        attribute: &str,
        ascending: bool,
        limit: usize,
    ) -> StatsResult<Vec<LeaderboardEntry>>;

    /// Unset `attribute` where it ranks after `requirement`, then delete records left
    /// without any attribute. Returns the number of values removed.
    async fn prune_attribute(
        &self,
        kind: SubjectKind,
        attribute: &str,
        requirement: f64,
        ascending: bool,
    ) -> StatsResult<u64>;

    async fn find_identity(&self, key: &IdentityKey) -> StatsResult<Option<ItemIdentity>>;

    async fn upsert_identity(&self, identity: ItemIdentity) -> StatsResult<()>;

    /// Keyed by auction id, recording an auction twice keeps a single document.
    async fn insert_auction(&self, record: AuctionRecord) -> StatsResult<()>;

    async fn find_auctions(
        &self,
        identity_id: &str,
        since: DateTime<Utc>,
    ) -> StatsResult<Vec<AuctionRecord>>;
}

type RecordKey = (String, String);

// In-process store, used by the binary and the tests
#[derive(Default)]
pub struct MemoryStore {
    leaderboards: Mutex<HashMap<SubjectKind, HashMap<RecordKey, LeaderboardRecord>>>,
    identities: Mutex<HashMap<IdentityKey, ItemIdentity>>,
    auctions: Mutex<HashMap<String, AuctionRecord>>,
    identity_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn identity_writes(&self) -> u64 {
        self.identity_writes.load(Ordering::Relaxed)
    }

    pub fn leaderboard_record(
        &self,
        kind: SubjectKind,
        subject_id: &str,
        group_id: &str,
    ) -> StatsResult<Option<LeaderboardRecord>> {
        let leaderboards = lock(&self.leaderboards)?;
        Ok(leaderboards
            .get(&kind)
            .and_then(|records| records.get(&(subject_id.to_string(), group_id.to_string())))
            .cloned())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> StatsResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| StatsError::Store(format!("Memory store lock poisoned. {e}")))
}

// Whether `value` ranks after `requirement`
fn ranks_after(value: f64, requirement: f64, ascending: bool) -> bool {
    match ascending {
        true => value > requirement,
        false => value < requirement,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_leaderboard_record(
        &self,
        kind: SubjectKind,
        subject_id: &str,
        group_id: &str,
    ) -> StatsResult<Option<LeaderboardRecord>> {
        self.leaderboard_record(kind, subject_id, group_id)
    }

    async fn upsert_leaderboard_record(
        &self,
        kind: SubjectKind,
        record: LeaderboardRecord,
    ) -> StatsResult<()> {
        let mut leaderboards = lock(&self.leaderboards)?;
        let key = (record.subject_id.clone(), record.group_id.clone());
        match leaderboards.entry(kind).or_default().entry(key) {
            Entry::Occupied(stored) if record.stats.is_empty() => {
                stored.remove();
            }
            Entry::Occupied(mut stored) => {
                let stored = stored.get_mut();
                stored.stats = record.stats;
                stored.updated_at = record.updated_at;
                if record.username.is_some() {
                    stored.username = record.username;
                }
            }
            Entry::Vacant(_) if record.stats.is_empty() => {}
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }
        Ok(())
    }

    async fn find_top(
        &self,
        kind: SubjectKind,
        attribute: &str,
        ascending: bool,
        limit: usize,
    ) -> StatsResult<Vec<LeaderboardEntry>> {
        let leaderboards = lock(&self.leaderboards)?;
        let mut entries = leaderboards
            .get(&kind)
            .map(|records| {
                records
                    .values()
                    .filter_map(|record| {
                        record.stats.get(attribute).map(|value| LeaderboardEntry {
                            subject_id: record.subject_id.clone(),
                            group_id: record.group_id.clone(),
                            username: record.username.clone(),
                            value: *value,
                        })
                    })
                    .collect::<Vec<LeaderboardEntry>>()
            })
            .unwrap_or_default();

        entries.sort_by(|a, b| {
            let order = match ascending {
                true => a.value.total_cmp(&b.value),
                false => b.value.total_cmp(&a.value),
            };
            order.then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn prune_attribute(
        &self,
        kind: SubjectKind,
        attribute: &str,
        requirement: f64,
        ascending: bool,
    ) -> StatsResult<u64> {
        let mut leaderboards = lock(&self.leaderboards)?;
        let records = match leaderboards.get_mut(&kind) {
            Some(records) => records,
            None => return Ok(0),
        };

        let mut removed = 0;
        for record in records.values_mut() {
            if let Some(value) = record.stats.get(attribute) {
                if ranks_after(*value, requirement, ascending) {
                    record.stats.remove(attribute);
                    removed += 1;
                }
            }
        }
        records.retain(|_, record| !record.stats.is_empty());
        Ok(removed)
    }

    async fn find_identity(&self, key: &IdentityKey) -> StatsResult<Option<ItemIdentity>> {
        Ok(lock(&self.identities)?.get(key).cloned())
    }

    async fn upsert_identity(&self, identity: ItemIdentity) -> StatsResult<()> {
        lock(&self.identities)?.insert(identity.key.clone(), identity);
        self.identity_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn insert_auction(&self, record: AuctionRecord) -> StatsResult<()> {
        lock(&self.auctions)?.insert(record.auction_id.clone(), record);
        Ok(())
    }

    async fn find_auctions(
        &self,
        identity_id: &str,
        since: DateTime<Utc>,
    ) -> StatsResult<Vec<AuctionRecord>> {
        let auctions = lock(&self.auctions)?;
        let mut found = auctions
            .values()
            .filter(|auction| auction.identity_id == identity_id && auction.ended_at >= since)
            .cloned()
            .collect::<Vec<AuctionRecord>>();
        found.sort_by_key(|auction| auction.ended_at);
        Ok(found)
    }
}
