use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, info};

use crate::cache::entity_cache::{CacheStats, EntityCache, Lookup};
use crate::error::{StatsError, StatsResult};
use crate::upstream::{Endpoint, UpstreamClient};
use crate::utils::{is_uuid, normalize_uuid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Uuid,
    Username,
    Player,
    BasicPlayer,
    Profile,
    ProfileList,
    ProfileName,
}

impl Tier {
    pub fn ttl(&self) -> Duration {
        match self {
            Tier::Uuid | Tier::Username => Duration::from_secs(6 * 60 * 60),
            Tier::Player => Duration::from_secs(5 * 60),
            Tier::BasicPlayer => Duration::from_secs(10 * 60),
            Tier::Profile | Tier::ProfileList => Duration::from_secs(5 * 60),
            Tier::ProfileName => Duration::from_secs(60 * 60),
        }
    }
}

/// Subset of the player document most callers need (ranks and display name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicPlayer {
    pub uuid: String,
    pub username: String,
    pub rank: Option<String>,
    pub first_login: Option<i64>,
}

impl BasicPlayer {
    pub fn from_player(uuid: &str, player: &Value) -> Self {
        // The most specific rank wins, staff ranks override paid ranks.
        let rank = ["rank", "monthlyPackageRank", "newPackageRank", "packageRank"]
            .iter()
            .filter_map(|field| player[*field].as_str())
            .find(|rank| *rank != "NONE" && *rank != "NORMAL")
            .map(|rank| rank.to_string());

        BasicPlayer {
            uuid: uuid.to_string(),
            username: player["displayname"].as_str().unwrap_or(uuid).to_string(),
            rank,
            first_login: player["firstLogin"].as_i64(),
        }
    }
}

/// Every cache tier in front of the upstream API, each with its own TTL.
pub struct EntityCaches {
    upstream: Arc<UpstreamClient>,
    // lowercase username => uuid
    uuids: EntityCache<String, String>,
    // uuid => username with its real capitalization
    usernames: EntityCache<String, String>,
    players: EntityCache<String, Value>,
    basic_players: EntityCache<String, BasicPlayer>,
    profiles: EntityCache<String, Value>,
    profile_lists: EntityCache<String, Vec<Value>>,
    // (uuid, lowercase profile name) => profile id
    profile_names: EntityCache<(String, String), String>,
}

impl EntityCaches {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        EntityCaches {
            upstream,
            uuids: EntityCache::new("uuid", Tier::Uuid.ttl()),
            usernames: EntityCache::new("username", Tier::Username.ttl()),
            players: EntityCache::new("player", Tier::Player.ttl()),
            basic_players: EntityCache::new("basic_player", Tier::BasicPlayer.ttl()),
            profiles: EntityCache::new("profile", Tier::Profile.ttl()),
            profile_lists: EntityCache::new("profile_list", Tier::ProfileList.ttl()),
            profile_names: EntityCache::new("profile_name", Tier::ProfileName.ttl()),
        }
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    /// Uuid for a username or uuid. `None` when no such account exists.
    pub async fn resolve_uuid(&self, name_or_uuid: &str) -> StatsResult<Option<String>> {
        if is_uuid(name_or_uuid) {
            return Ok(Some(normalize_uuid(name_or_uuid)));
        }
        let name = name_or_uuid.to_lowercase();

        match self.uuids.get(&name) {
            Lookup::Hit(uuid) => return Ok(Some(uuid)),
            Lookup::Absent => return Ok(None),
            Lookup::Miss => {}
        }
        if let Some(uuid) = self
            .usernames
            .find_key(|username| username.eq_ignore_ascii_case(&name))
        {
            debug!("Resolved {} from cached usernames", name_or_uuid);
            return Ok(Some(uuid));
        }

        let account = self
            .uuids
            .get_or_fetch(name.clone(), || async {
                let account = self.fetch_account(Endpoint::UuidByName(name.clone())).await?;
                self.usernames.insert(account.0.clone(), Some(account.1));
                Ok(Some(account.0))
            })
            .await?;
        Ok(account)
    }

    /// Username, with its real capitalization, for a uuid.
    pub async fn resolve_username(&self, uuid: &str) -> StatsResult<Option<String>> {
        let uuid = normalize_uuid(uuid);
        match self.usernames.get(&uuid) {
            Lookup::Hit(username) => return Ok(Some(username)),
            Lookup::Absent => return Ok(None),
            Lookup::Miss => {}
        }

        self.usernames
            .get_or_fetch(uuid.clone(), || async {
                let (uuid, username) = self.fetch_account(Endpoint::NameByUuid(uuid.clone())).await?;
                self.uuids.insert(username.to_lowercase(), Some(uuid));
                Ok(Some(username))
            })
            .await
    }

    pub async fn player(&self, uuid: &str) -> StatsResult<Option<Value>> {
        let uuid = normalize_uuid(uuid);
        self.players
            .get_or_fetch(uuid.clone(), || async {
                let response = self.upstream.send(&Endpoint::Player(uuid.clone())).await?;
                match &response["player"] {
                    Value::Null => Ok(None),
                    player => {
                        if let Some(name) = player["displayname"].as_str() {
                            self.usernames.insert(uuid.clone(), Some(name.to_string()));
                        }
                        Ok(Some(player.clone()))
                    }
                }
            })
            .await
    }

    pub async fn basic_player(&self, uuid: &str) -> StatsResult<Option<BasicPlayer>> {
        let uuid = normalize_uuid(uuid);
        self.basic_players
            .get_or_fetch(uuid.clone(), || async {
                let player = self.player(&uuid).await?;
                Ok(player.map(|player| BasicPlayer::from_player(&uuid, &player)))
            })
            .await
    }

    /// All profiles of a player. Each profile is also stored in the profile tier.
    pub async fn profiles(&self, uuid: &str) -> StatsResult<Option<Vec<Value>>> {
        let uuid = normalize_uuid(uuid);
        self.profile_lists
            .get_or_fetch(uuid.clone(), || async {
                let response = self.upstream.send(&Endpoint::Profiles(uuid.clone())).await?;
                let profiles = match response["profiles"].as_array() {
                    Some(profiles) if !profiles.is_empty() => profiles.clone(),
                    _ => return Ok(None),
                };
                for profile in profiles.iter() {
                    if let Some(profile_id) = profile["profile_id"].as_str() {
                        self.profiles
                            .insert(normalize_uuid(profile_id), Some(profile.clone()));
                        if let Some(name) = profile["cute_name"].as_str() {
                            self.profile_names.insert(
                                (uuid.clone(), name.to_lowercase()),
                                Some(normalize_uuid(profile_id)),
                            );
                        }
                    }
                }
                Ok(Some(profiles))
            })
            .await
    }

    pub async fn profile(&self, profile_id: &str) -> StatsResult<Option<Value>> {
        let profile_id = normalize_uuid(profile_id);
        self.profiles
            .get_or_fetch(profile_id.clone(), || async {
                let response = self
                    .upstream
                    .send(&Endpoint::Profile(profile_id.clone()))
                    .await?;
                match &response["profile"] {
                    Value::Null => Ok(None),
                    profile => Ok(Some(profile.clone())),
                }
            })
            .await
    }

    /// Profile id of the player's profile named `profile_name` (case insensitive).
    pub async fn profile_id_by_name(
        &self,
        uuid: &str,
        profile_name: &str,
    ) -> StatsResult<Option<String>> {
        let uuid = normalize_uuid(uuid);
        let key = (uuid.clone(), profile_name.to_lowercase());
        self.profile_names
            .get_or_fetch(key, || async {
                let profiles = self.profiles(&uuid).await?.unwrap_or_default();
                Ok(profiles
                    .iter()
                    .find(|profile| {
                        profile["cute_name"]
                            .as_str()
                            .map_or(false, |name| name.eq_ignore_ascii_case(profile_name))
                    })
                    .and_then(|profile| profile["profile_id"].as_str())
                    .map(normalize_uuid))
            })
            .await
    }

    /// Active expiry over every tier.
    pub fn sweep(&self) -> usize {
        let removed = Tier::iter()
            .map(|tier| match tier {
                Tier::Uuid => self.uuids.sweep(),
                Tier::Username => self.usernames.sweep(),
                Tier::Player => self.players.sweep(),
                Tier::BasicPlayer => self.basic_players.sweep(),
                Tier::Profile => self.profiles.sweep(),
                Tier::ProfileList => self.profile_lists.sweep(),
                Tier::ProfileName => self.profile_names.sweep(),
            })
            .sum();
        if removed > 0 {
            info!("Cache sweep removed {} expired entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> HashMap<Tier, CacheStats> {
        Tier::iter()
            .map(|tier| {
                let stats = match tier {
                    Tier::Uuid => self.uuids.stats(),
                    Tier::Username => self.usernames.stats(),
                    Tier::Player => self.players.stats(),
                    Tier::BasicPlayer => self.basic_players.stats(),
                    Tier::Profile => self.profiles.stats(),
                    Tier::ProfileList => self.profile_lists.stats(),
                    Tier::ProfileName => self.profile_names.stats(),
                };
                (tier, stats)
            })
            .collect()
    }

    // (uuid, username) from the account API
    async fn fetch_account(&self, endpoint: Endpoint) -> StatsResult<(String, String)> {
        let response = self.upstream.send(&endpoint).await?;
        match (response["id"].as_str(), response["name"].as_str()) {
            (Some(uuid), Some(name)) => Ok((normalize_uuid(uuid), name.to_string())),
            _ => Err(StatsError::Parse(format!(
                "Account response for {} misses id or name",
                endpoint
            ))),
        }
    }
}
