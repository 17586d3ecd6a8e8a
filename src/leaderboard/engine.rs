use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, OnceCell},
    time::{self, Instant},
};
use tracing::{debug, info};

use crate::error::{StatsError, StatsResult};
use crate::leaderboard::attributes::{
    AttributeCatalog, LeaderboardAttribute, SubjectKind, SubjectUpdate, LEADERBOARDS_COUNT,
    TOP_1_LEADERBOARDS_COUNT,
};
use crate::leaderboard::window::{LeaderboardWindow, WINDOW_SIZE};
use crate::storage::{LeaderboardEntry, LeaderboardRecord, Store};

type WindowKey = (SubjectKind, String);
type SharedWindow = Arc<Mutex<LeaderboardWindow>>;
// kind, subject id, group id
type SubjectKey = (SubjectKind, String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    // Dropped, the same subject was updated moments ago
    Debounced,
    Updated { qualified: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attributes: usize,
    pub pruned: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub position: usize,
    #[serde(flatten)]
    pub entry: LeaderboardEntry,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub debounce: Duration,
    pub sweep_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            debounce: Duration::from_secs(180),
            sweep_delay: Duration::from_millis(250),
        }
    }
}

pub struct LeaderboardEngine {
    store: Arc<dyn Store>,
    catalog: Arc<dyn AttributeCatalog>,
    // Loaded from the store on first access, then kept in memory
    windows: DashMap<WindowKey, Arc<OnceCell<SharedWindow>>>,
    recent_updates: DashMap<SubjectKey, Instant>,
    config: EngineConfig,
}

impl LeaderboardEngine {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<dyn AttributeCatalog>,
        config: EngineConfig,
    ) -> Self {
        LeaderboardEngine {
            store,
            catalog,
            windows: DashMap::new(),
            recent_updates: DashMap::new(),
            config,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn AttributeCatalog> {
        &self.catalog
    }

    /// Rank a subject. Only the attributes making it into their window are persisted.
    pub async fn update(&self, update: SubjectUpdate) -> StatsResult<UpdateOutcome> {
        if self.is_debounced(&update) {
            debug!(
                "Dropping {} update for {}, updated less than {:?} ago",
                update.kind, update.subject_id, self.config.debounce
            );
            return Ok(UpdateOutcome::Debounced);
        }
        let kind = update.kind;
        let (subject_id, group_id) = (update.subject_id.as_str(), update.group_id.as_str());

        let mut qualifying = BTreeMap::new();
        let mut top_1 = 0;
        for (name, value) in update.candidate_attributes() {
            if self.catalog.add_observed(kind, &name) {
                info!("New {} leaderboard attribute '{}'", kind, name);
            }
            let window = self.window(kind, &name).await?;
            let window = window.lock().await;
            if window.admits_subject(subject_id, group_id, value) {
                if window.would_rank_first(subject_id, group_id, value) {
                    top_1 += 1;
                }
                qualifying.insert(name, value);
            }
        }

        let counts = [
            (LEADERBOARDS_COUNT, qualifying.len()),
            (TOP_1_LEADERBOARDS_COUNT, top_1),
        ];
        for (name, count) in counts {
            if count == 0 {
                continue;
            }
            let window = self.window(kind, name).await?;
            if window
                .lock()
                .await
                .admits_subject(subject_id, group_id, count as f64)
            {
                qualifying.insert(name.to_string(), count as f64);
            }
        }

        // Attributes held before that no longer qualify
        let stale = self
            .store
            .find_leaderboard_record(kind, subject_id, group_id)
            .await?
            .map(|previous| {
                previous
                    .stats
                    .into_keys()
                    .filter(|name| !qualifying.contains_key(name))
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();

        if qualifying.is_empty() && stale.is_empty() {
            return Ok(UpdateOutcome::Updated { qualified: 0 });
        }

        let record = LeaderboardRecord {
            subject_id: subject_id.to_string(),
            group_id: group_id.to_string(),
            username: update.username.clone(),
            stats: qualifying.clone(),
            updated_at: Utc::now(),
        };
        self.store.upsert_leaderboard_record(kind, record).await?;

        for name in stale.iter() {
            let window = self.window(kind, name).await?;
            window.lock().await.remove(subject_id, group_id);
        }
        for (name, value) in qualifying.iter() {
            let window = self.window(kind, name).await?;
            window.lock().await.upsert(LeaderboardEntry {
                subject_id: subject_id.to_string(),
                group_id: group_id.to_string(),
                username: update.username.clone(),
                value: *value,
            });
        }
        debug!(
            "{} {} qualified for {} leaderboards",
            kind,
            subject_id,
            qualifying.len()
        );
        Ok(UpdateOutcome::Updated {
            qualified: qualifying.len(),
        })
    }

    // Records the update time when the subject is not debounced
    fn is_debounced(&self, update: &SubjectUpdate) -> bool {
        let key = (
            update.kind,
            update.subject_id.clone(),
            update.group_id.clone(),
        );
        let now = Instant::now();
        match self.recent_updates.entry(key) {
            Entry::Occupied(last) if now.duration_since(*last.get()) < self.config.debounce => {
                true
            }
            Entry::Occupied(mut last) => {
                last.insert(now);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                false
            }
        }
    }

    async fn window(&self, kind: SubjectKind, name: &str) -> StatsResult<SharedWindow> {
        let cell = self
            .windows
            .entry((kind, name.to_string()))
            .or_default()
            .clone();
        let window = cell
            .get_or_try_init(|| async {
                let attribute = LeaderboardAttribute::new(name);
                let entries = self
                    .store
                    .find_top(kind, name, attribute.is_ascending(), WINDOW_SIZE)
                    .await?;
                debug!(
                    "Loaded {} {} leaderboard with {} entries",
                    kind,
                    name,
                    entries.len()
                );
                Ok::<SharedWindow, StatsError>(Arc::new(Mutex::new(
                    LeaderboardWindow::from_entries(attribute, entries),
                )))
            })
            .await?;
        Ok(window.clone())
    }

    /// Reload every known attribute from the store and unset persisted values
    /// ranking after the last place. One attribute at a time.
    pub async fn sweep(&self, kind: SubjectKind) -> StatsResult<SweepReport> {
        let mut report = SweepReport::default();
        for name in self.catalog.known_attributes(kind) {
            let attribute = LeaderboardAttribute::new(&name);
            let ascending = attribute.is_ascending();

            // Updates to this attribute wait for the reload
            let shared = self.window(kind, &name).await?;
            let mut loaded = shared.lock().await;
            let entries = self
                .store
                .find_top(kind, &name, ascending, WINDOW_SIZE)
                .await?;
            let window = LeaderboardWindow::from_entries(attribute, entries);

            if let Some(requirement) = window.requirement() {
                report.pruned += self
                    .store
                    .prune_attribute(kind, &name, requirement, ascending)
                    .await?;
            }
            *loaded = window;
            drop(loaded);

            report.attributes += 1;
            time::sleep(self.config.sweep_delay).await;
        }

        // Debounce entries are only useful within the debounce window
        let now = Instant::now();
        self.recent_updates
            .retain(|_, last| now.duration_since(*last) < self.config.debounce);

        info!(
            "Swept {} {} leaderboards, {} values pruned",
            report.attributes, kind, report.pruned
        );
        Ok(report)
    }

    /// One page of a leaderboard, `page` starting at 1.
    pub async fn leaderboard(
        &self,
        kind: SubjectKind,
        attribute: &str,
        page: usize,
        page_size: usize,
    ) -> StatsResult<Vec<RankedEntry>> {
        let offset = page.max(1).saturating_sub(1).saturating_mul(page_size);
        let window = self.window(kind, attribute).await?;
        let window = window.lock().await;
        Ok(window
            .top(offset, page_size)
            .iter()
            .enumerate()
            .map(|(i, entry)| RankedEntry {
                position: offset + i + 1,
                entry: entry.clone(),
            })
            .collect())
    }

    pub async fn rank_of(
        &self,
        kind: SubjectKind,
        attribute: &str,
        subject_id: &str,
        group_id: &str,
    ) -> StatsResult<Option<usize>> {
        let window = self.window(kind, attribute).await?;
        let position = window.lock().await.position_of(subject_id, group_id);
        Ok(position)
    }

    /// Value to beat to enter the leaderboard, `None` while places are left.
    pub async fn requirement(&self, kind: SubjectKind, attribute: &str) -> StatsResult<Option<f64>> {
        let window = self.window(kind, attribute).await?;
        let requirement = window.lock().await.requirement();
        Ok(requirement)
    }
}
