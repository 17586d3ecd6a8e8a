use chrono::{DateTime, Utc};
use std::sync::{Arc, Once};
use strum::IntoEnumIterator;
use tracing::{error, info, warn};

use crate::cache::EntityCaches;
use crate::config::Settings;
use crate::error::{StatsError, StatsResult};
use crate::items::{
    AuctionLedger, AuctionObservation, ItemIdentityResolver, ItemObservation, PriceSummary,
};
use crate::leaderboard::{
    AttributeCatalog, EngineConfig, LeaderboardEngine, RankedEntry, StaticCatalog, SubjectKind,
    SubjectUpdate, SweepReport,
};
use crate::storage::Store;
use crate::upstream::{CredentialPool, CredentialStatus, UpstreamClient, UpstreamConfig};

static STORE_UNAVAILABLE: Once = Once::new();

fn warn_store_unavailable() {
    STORE_UNAVAILABLE.call_once(|| {
        warn!("No persistent store configured, leaderboards and item identities are disabled")
    });
}

// Features backed by the persistent store
struct Persistence {
    leaderboards: Arc<LeaderboardEngine>,
    identities: Arc<ItemIdentityResolver>,
    auctions: AuctionLedger,
}

/// Every process wide component, built once at startup and shared.
pub struct StatsService {
    caches: Arc<EntityCaches>,
    persistence: Option<Persistence>,
}

impl StatsService {
    pub fn from_settings(settings: &Settings, store: Option<Arc<dyn Store>>) -> StatsResult<Self> {
        let keys = settings.api_keys();
        if keys.is_empty() {
            warn!("No API key configured, only public endpoints can be queried");
        }
        let pool = Arc::new(CredentialPool::new(keys, settings.api_key_pool_size));
        let upstream = UpstreamClient::new(UpstreamConfig::from_settings(settings), pool)?;
        let config = EngineConfig {
            debounce: settings.leaderboard_debounce(),
            sweep_delay: settings.leaderboard_sweep_delay(),
        };
        Ok(StatsService::new(
            Arc::new(EntityCaches::new(Arc::new(upstream))),
            store,
            Arc::new(StaticCatalog::new()),
            config,
        ))
    }

    pub fn new(
        caches: Arc<EntityCaches>,
        store: Option<Arc<dyn Store>>,
        catalog: Arc<dyn AttributeCatalog>,
        config: EngineConfig,
    ) -> Self {
        let persistence = store.map(|store| {
            let identities = Arc::new(ItemIdentityResolver::new(store.clone()));
            Persistence {
                leaderboards: Arc::new(LeaderboardEngine::new(store.clone(), catalog, config)),
                auctions: AuctionLedger::new(identities.clone(), store),
                identities,
            }
        });
        StatsService {
            caches,
            persistence,
        }
    }

    pub fn caches(&self) -> &Arc<EntityCaches> {
        &self.caches
    }

    pub fn credentials(&self) -> Vec<CredentialStatus> {
        self.caches.upstream().pool().status()
    }

    fn persistence(&self) -> StatsResult<&Persistence> {
        self.persistence.as_ref().ok_or_else(|| {
            warn_store_unavailable();
            StatsError::StoreUnavailable
        })
    }

    pub fn leaderboards(&self) -> StatsResult<&Arc<LeaderboardEngine>> {
        Ok(&self.persistence()?.leaderboards)
    }

    /// Rank a subject in the background. A no-op without persistent store.
    pub fn submit(&self, update: SubjectUpdate) {
        let engine = match self.leaderboards() {
            Ok(engine) => engine.clone(),
            Err(_) => return,
        };
        tokio::spawn(async move {
            let subject_id = update.subject_id.clone();
            if let Err(e) = engine.update(update).await {
                error!("Could not update leaderboards of {}. {}", subject_id, e);
            }
        });
    }

    /// Fetch every profile of a player and rank the player and the profiles.
    /// Returns the number of updates submitted, `None` for unknown players.
    pub async fn refresh_player(&self, name_or_uuid: &str) -> StatsResult<Option<usize>> {
        let uuid = match self.caches.resolve_uuid(name_or_uuid).await? {
            Some(uuid) => uuid,
            None => return Ok(None),
        };
        let username = self.caches.resolve_username(&uuid).await?;
        let profiles = self.caches.profiles(&uuid).await?.unwrap_or_default();

        let mut submitted = 0;
        for profile in profiles.iter() {
            if let Some(mut update) = SubjectUpdate::from_profile_member(&uuid, profile) {
                update.username = username.clone();
                self.submit(update);
                submitted += 1;
            }
            if let Some(update) = SubjectUpdate::from_profile(profile) {
                self.submit(update);
                submitted += 1;
            }
        }
        info!(
            "Refreshed {} ({}), {} leaderboard updates submitted",
            name_or_uuid, uuid, submitted
        );
        Ok(Some(submitted))
    }

    pub async fn leaderboard(
        &self,
        kind: SubjectKind,
        attribute: &str,
        page: usize,
        page_size: usize,
    ) -> StatsResult<Vec<RankedEntry>> {
        self.leaderboards()?
            .leaderboard(kind, attribute, page, page_size)
            .await
    }

    /// Item identity, `None` when unknown or when no store is configured.
    pub async fn resolve_item(
        &self,
        observation: &ItemObservation,
        update_store: bool,
    ) -> StatsResult<Option<String>> {
        match self.persistence() {
            Ok(persistence) => persistence.identities.resolve(observation, update_store).await,
            Err(_) => Ok(None),
        }
    }

    pub async fn record_auction(&self, auction: &AuctionObservation) -> StatsResult<Option<String>> {
        match self.persistence() {
            Ok(persistence) => persistence.auctions.record(auction).await,
            Err(_) => Ok(None),
        }
    }

    pub async fn price_summary(
        &self,
        identity_id: &str,
        since: DateTime<Utc>,
    ) -> StatsResult<Option<PriceSummary>> {
        match self.persistence() {
            Ok(persistence) => persistence.auctions.price_summary(identity_id, since).await,
            Err(_) => Ok(None),
        }
    }

    pub fn sweep_caches(&self) -> usize {
        self.caches.sweep()
    }

    pub async fn sweep_leaderboards(&self) -> StatsResult<Vec<(SubjectKind, SweepReport)>> {
        let engine = self.leaderboards()?;
        let mut reports = Vec::new();
        for kind in SubjectKind::iter() {
            reports.push((kind, engine.sweep(kind).await?));
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use figment::{providers::Serialized, Figment};
    use std::time::Duration;

    const UUID: &str = "069a79f444e94726a5befca90e38aaf5";

    fn settings(base_url: &str) -> Settings {
        Settings::from_figment(
            Figment::new()
                .merge(Serialized::default("api_base_url", base_url))
                .merge(Serialized::default("mojang_base_url", base_url))
                .merge(Serialized::default("api_keys", "0123456789abcdef"))
                .merge(Serialized::default("transport_retries", 0)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn missing_store_degrades_to_no_ops() {
        let server = mockito::Server::new_async().await;
        let service = StatsService::from_settings(&settings(&server.url()), None).unwrap();

        assert!(matches!(
            service.leaderboards(),
            Err(StatsError::StoreUnavailable)
        ));
        service.submit(SubjectUpdate::player(UUID, "profile"));
        let item = ItemObservation {
            id: "PET".to_string(),
            ..Default::default()
        };
        assert_eq!(service.resolve_item(&item, true).await.unwrap(), None);
        assert_eq!(
            service.price_summary("any", Utc::now()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn refreshed_player_is_ranked() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/profiles/minecraft/notch")
            .with_status(200)
            .with_body(format!(r#"{{"id":"{}","name":"Notch"}}"#, UUID))
            .create_async()
            .await;
        server
            .mock("GET", "/v2/skyblock/profiles")
            .match_query(mockito::Matcher::Any)
            .match_header("API-Key", "0123456789abcdef")
            .with_status(200)
            .with_body(format!(
                r#"{{"success":true,"profiles":[{{
                    "profile_id":"p1","cute_name":"Apple","banking":{{"balance":10.0}},
                    "members":{{"{}":{{"stats":{{"kills_zombie":10000}}}}}}
                }}]}}"#,
                UUID
            ))
            .create_async()
            .await;

        let store = Arc::new(MemoryStore::new());
        let service =
            StatsService::from_settings(&settings(&server.url()), Some(store.clone())).unwrap();
        assert_eq!(service.refresh_player("Notch").await.unwrap(), Some(2));

        // Updates run in the background
        let mut position = None;
        for _ in 0..50 {
            position = service
                .leaderboards()
                .unwrap()
                .rank_of(SubjectKind::Player, "kills_zombie", UUID, "p1")
                .await
                .unwrap();
            if position.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(position, Some(1));
        assert_eq!(service.credentials().len(), 1);
    }
}
