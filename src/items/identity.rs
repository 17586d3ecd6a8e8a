use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::StatsResult;
use crate::items::template::reconcile;
use crate::storage::Store;

const ENCHANTED_BOOK: &str = "ENCHANTED_BOOK";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PotionAttrs {
    pub potion: Option<String>,
    pub level: Option<u32>,
    pub extended: bool,
    pub enhanced: bool,
    pub splash: bool,
}

/// One item as seen in an inventory or an auction, already reshaped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemObservation {
    pub id: String,
    pub vanilla_id: Option<String>,
    pub pet_type: Option<String>,
    pub tier: Option<String>,
    pub potion: Option<PotionAttrs>,
    pub reforge: Option<String>,
    pub enchantments: BTreeMap<String, u32>,
    pub name: String,
    pub lore: Vec<String>,
    pub head_texture: Option<String>,
}

impl ItemObservation {
    pub fn lore_text(&self) -> String {
        self.lore.join("\n")
    }
}

/// Non-text fields two observations of the same item share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub id: String,
    pub vanilla_id: Option<String>,
    pub pet_type: Option<String>,
    pub tier: Option<String>,
    pub potion: Option<PotionAttrs>,
    // Only books are told apart by their enchantments
    pub enchantments: Option<BTreeMap<String, u32>>,
}

impl IdentityKey {
    pub fn from_observation(observation: &ItemObservation) -> Self {
        let enchantments = match observation.id == ENCHANTED_BOOK {
            true => Some(observation.enchantments.clone()),
            false => None,
        };
        IdentityKey {
            id: observation.id.clone(),
            vanilla_id: observation.vanilla_id.clone(),
            pet_type: observation.pet_type.clone(),
            tier: observation.tier.clone(),
            potion: observation.potion.clone(),
            enchantments,
        }
    }

    /// Stable id derived from the key, the same across restarts.
    pub fn identity_id(&self) -> StatsResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, &bytes)
            .simple()
            .to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemIdentity {
    pub id: String,
    pub key: IdentityKey,
    pub name_template: String,
    pub lore_template: String,
    pub head_texture: Option<String>,
    pub reforged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ItemIdentity {
    fn from_observation(key: IdentityKey, observation: &ItemObservation) -> StatsResult<Self> {
        let now = Utc::now();
        Ok(ItemIdentity {
            id: key.identity_id()?,
            key,
            name_template: observation.name.clone(),
            lore_template: observation.lore_text(),
            head_texture: observation.head_texture.clone(),
            reforged: observation.reforge.is_some(),
            created_at: now,
            updated_at: now,
        })
    }

    fn same_content(&self, other: &ItemIdentity) -> bool {
        self.name_template == other.name_template
            && self.lore_template == other.lore_template
            && self.head_texture == other.head_texture
            && self.reforged == other.reforged
    }
}

/// Maps item observations to stable identities, learning text templates as it goes.
pub struct ItemIdentityResolver {
    store: Arc<dyn Store>,
    // Serializes read-reconcile-write per identity
    writers: DashMap<IdentityKey, Arc<Mutex<()>>>,
}

impl ItemIdentityResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        ItemIdentityResolver {
            store,
            writers: DashMap::new(),
        }
    }

    /// Identity id of the observed item. Without `update_store` this is a pure lookup,
    /// returning `None` for items never stored.
    pub async fn resolve(
        &self,
        observation: &ItemObservation,
        update_store: bool,
    ) -> StatsResult<Option<String>> {
        let key = IdentityKey::from_observation(observation);
        if !update_store {
            let stored = self.store.find_identity(&key).await?;
            return Ok(stored.map(|identity| identity.id));
        }

        let writer = self.writers.entry(key.clone()).or_default().clone();
        let _writing = writer.lock().await;
        let stored = self.store.find_identity(&key).await?;

        let stored = match stored {
            Some(stored) => stored,
            None => {
                let identity = ItemIdentity::from_observation(key, observation)?;
                let id = identity.id.clone();
                debug!("New item identity {} for {}", id, observation.id);
                self.store.upsert_identity(identity).await?;
                return Ok(Some(id));
            }
        };

        let mut updated = stored.clone();
        match (stored.reforged, observation.reforge.is_some()) {
            // Reforge names would end up in the template
            (false, true) => return Ok(Some(stored.id)),
            (true, false) => {
                updated.name_template = observation.name.clone();
                updated.lore_template = observation.lore_text();
                updated.reforged = false;
            }
            _ => {
                updated.name_template = reconcile(&stored.name_template, &observation.name);
                updated.lore_template = reconcile(&stored.lore_template, &observation.lore_text());
            }
        }
        if observation.head_texture.is_some() {
            updated.head_texture = observation.head_texture.clone();
        }

        if !updated.same_content(&stored) {
            updated.updated_at = Utc::now();
            self.store.upsert_identity(updated).await?;
        }
        Ok(Some(stored.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::SteppedStore;
    use crate::storage::MemoryStore;

    fn pet(level: u32, reforge: Option<&str>) -> ItemObservation {
        ItemObservation {
            id: "PET".to_string(),
            pet_type: Some("RABBIT".to_string()),
            tier: Some("LEGENDARY".to_string()),
            reforge: reforge.map(|r| r.to_string()),
            name: format!("[Lvl {level}] Rabbit"),
            lore: vec!["§7Speed: §a+10".to_string(), format!("§7Level {level}")],
            ..Default::default()
        }
    }

    fn resolver() -> (Arc<MemoryStore>, ItemIdentityResolver) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ItemIdentityResolver::new(store))
    }

    async fn stored(store: &MemoryStore, observation: &ItemObservation) -> ItemIdentity {
        store
            .find_identity(&IdentityKey::from_observation(observation))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn lookup_after_store_returns_the_same_identity() {
        let (store, resolver) = resolver();
        assert_eq!(resolver.resolve(&pet(1, None), false).await.unwrap(), None);

        let id = resolver.resolve(&pet(1, None), true).await.unwrap();
        assert!(id.is_some());
        assert_eq!(resolver.resolve(&pet(1, None), false).await.unwrap(), id);
        assert_eq!(store.identity_writes(), 1);
    }

    #[tokio::test]
    async fn identical_text_does_not_write() {
        let (store, resolver) = resolver();
        resolver.resolve(&pet(1, None), true).await.unwrap();
        resolver.resolve(&pet(1, None), true).await.unwrap();
        assert_eq!(store.identity_writes(), 1);
    }

    #[tokio::test]
    async fn differing_text_is_reconciled() {
        let (store, resolver) = resolver();
        let first = resolver.resolve(&pet(1, None), true).await.unwrap();
        let second = resolver.resolve(&pet(99, None), true).await.unwrap();
        assert_eq!(first, second);

        let identity = stored(&store, &pet(1, None)).await;
        assert_eq!(identity.name_template, "[Lvl ?] Rabbit");
        assert_eq!(identity.lore_template, "§7Speed: §a+10\n§7Level ?");
        assert_eq!(store.identity_writes(), 2);

        // Already collapsed
        resolver.resolve(&pet(42, None), true).await.unwrap();
        assert_eq!(store.identity_writes(), 2);
    }

    #[tokio::test]
    async fn reforged_observation_leaves_a_clean_template_alone() {
        let (store, resolver) = resolver();
        resolver.resolve(&pet(1, None), true).await.unwrap();

        let mut reforged = pet(5, Some("Shiny"));
        reforged.name = "Shiny [Lvl 5] Rabbit".to_string();
        resolver.resolve(&reforged, true).await.unwrap();

        let identity = stored(&store, &reforged).await;
        assert_eq!(identity.name_template, "[Lvl 1] Rabbit");
        assert!(!identity.reforged);
        assert_eq!(store.identity_writes(), 1);
    }

    #[tokio::test]
    async fn clean_observation_replaces_a_reforged_template() {
        let (store, resolver) = resolver();
        let mut reforged = pet(5, Some("Shiny"));
        reforged.name = "Shiny [Lvl 5] Rabbit".to_string();
        resolver.resolve(&reforged, true).await.unwrap();
        assert!(stored(&store, &reforged).await.reforged);

        resolver.resolve(&pet(7, None), true).await.unwrap();
        let identity = stored(&store, &reforged).await;
        assert_eq!(identity.name_template, "[Lvl 7] Rabbit");
        assert!(!identity.reforged);
    }

    #[tokio::test]
    async fn concurrent_observations_are_reconciled_one_after_the_other() {
        let store = Arc::new(SteppedStore::default());
        let resolver = ItemIdentityResolver::new(store.clone());
        resolver.resolve(&pet(1, None), true).await.unwrap();

        let mut faster = pet(1, None);
        faster.lore[0] = "§7Speed: §a+20".to_string();
        let higher = pet(5, None);
        let (a, b) = tokio::join!(resolver.resolve(&faster, true), resolver.resolve(&higher, true));
        assert_eq!(a.unwrap(), b.unwrap());

        let identity = stored(&store.inner, &higher).await;
        assert_eq!(identity.name_template, "[Lvl ?] Rabbit");
        assert_eq!(identity.lore_template, "§7Speed: §a+??\n§7Level ?");
    }

    #[test]
    fn enchantments_only_tell_books_apart() {
        let mut sword = ItemObservation {
            id: "ASPECT_OF_THE_END".to_string(),
            ..Default::default()
        };
        let plain = IdentityKey::from_observation(&sword);
        sword.enchantments.insert("sharpness".to_string(), 5);
        assert_eq!(IdentityKey::from_observation(&sword), plain);

        let mut book = ItemObservation {
            id: ENCHANTED_BOOK.to_string(),
            ..Default::default()
        };
        let empty_book = IdentityKey::from_observation(&book);
        book.enchantments.insert("sharpness".to_string(), 5);
        let book_key = IdentityKey::from_observation(&book);
        assert_ne!(book_key, empty_book);
        assert_ne!(
            book_key.identity_id().unwrap(),
            empty_book.identity_id().unwrap()
        );
        assert_eq!(
            book_key.identity_id().unwrap(),
            IdentityKey::from_observation(&book).identity_id().unwrap()
        );
    }
}
