use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp,
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::RwLock,
};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::utils::normalize_uuid;

pub const LEADERBOARDS_COUNT: &str = "leaderboards_count";
pub const TOP_1_LEADERBOARDS_COUNT: &str = "top_1_leaderboards_count";

// Times, where the lowest value ranks first
static REGEX_REVERSED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^fastest_|_fastest_|_best_time(?:_\d+)?$)").unwrap());

pub fn is_reversed(attribute: &str) -> bool {
    REGEX_REVERSED.is_match(attribute)
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    // A player within one profile
    #[default]
    Player,
    // A whole profile (shared bank, minions, ...)
    Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Descending,
    Ascending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardAttribute {
    pub name: String,
    pub direction: Direction,
}

impl LeaderboardAttribute {
    pub fn new(name: &str) -> Self {
        let direction = match is_reversed(name) {
            true => Direction::Ascending,
            false => Direction::Descending,
        };
        LeaderboardAttribute {
            name: name.to_string(),
            direction,
        }
    }

    pub fn is_ascending(&self) -> bool {
        self.direction == Direction::Ascending
    }

    /// Whether `value` ranks strictly before `other`.
    pub fn beats(&self, value: f64, other: f64) -> bool {
        self.compare(value, other) == cmp::Ordering::Less
    }

    /// Ranking order, `Less` meaning `value` is placed first.
    pub fn compare(&self, value: f64, other: f64) -> cmp::Ordering {
        match self.direction {
            Direction::Descending => other.total_cmp(&value),
            Direction::Ascending => value.total_cmp(&other),
        }
    }
}

/// Taxonomy of the attributes leaderboards exist for.
pub trait AttributeCatalog: Send + Sync {
    fn known_attributes(&self, kind: SubjectKind) -> Vec<String>;

    /// Record an attribute seen in an update. Returns true when it was not known yet.
    fn add_observed(&self, kind: SubjectKind, name: &str) -> bool;
}

const DEFAULT_PLAYER_ATTRIBUTES: [&str; 14] = [
    "kills",
    "deaths",
    "highest_crit_damage",
    "fairy_souls_collected",
    "skill_farming",
    "skill_mining",
    "skill_combat",
    "skill_foraging",
    "skill_fishing",
    "skill_enchanting",
    "slayer_zombie",
    "slayer_spider",
    "slayer_wolf",
    "dungeons_catacombs_fastest_time_s_plus",
];

const DEFAULT_PROFILE_ATTRIBUTES: [&str; 3] = ["bank", "unique_minions", "members_slots"];

pub struct StaticCatalog {
    attributes: RwLock<HashMap<SubjectKind, BTreeSet<String>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        let catalog = StaticCatalog::empty();
        for name in DEFAULT_PLAYER_ATTRIBUTES
            .iter()
            .chain([LEADERBOARDS_COUNT, TOP_1_LEADERBOARDS_COUNT].iter())
        {
            catalog.add_observed(SubjectKind::Player, name);
        }
        for name in DEFAULT_PROFILE_ATTRIBUTES.iter() {
            catalog.add_observed(SubjectKind::Profile, name);
        }
        catalog
    }

    pub fn empty() -> Self {
        StaticCatalog {
            attributes: RwLock::new(SubjectKind::iter().map(|k| (k, BTreeSet::new())).collect()),
        }
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        StaticCatalog::new()
    }
}

impl AttributeCatalog for StaticCatalog {
    fn known_attributes(&self, kind: SubjectKind) -> Vec<String> {
        let attributes = match self.attributes.read() {
            Ok(attributes) => attributes,
            Err(poisoned) => poisoned.into_inner(),
        };
        attributes
            .get(&kind)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn add_observed(&self, kind: SubjectKind, name: &str) -> bool {
        let mut attributes = match self.attributes.write() {
            Ok(attributes) => attributes,
            Err(poisoned) => poisoned.into_inner(),
        };
        attributes.entry(kind).or_default().insert(name.to_string())
    }
}

/// Reshaped stats of one subject, as handed over by the data cleaning step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectUpdate {
    pub kind: SubjectKind,
    // uuid for players, profile id for profiles
    pub subject_id: String,
    // profile id
    pub group_id: String,
    pub username: Option<String>,
    // Stat names exactly as the upstream API reports them
    pub raw_stats: BTreeMap<String, f64>,
    pub stats: BTreeMap<String, f64>,
    pub collections: BTreeMap<String, f64>,
    pub skills: BTreeMap<String, f64>,
    pub slayers: BTreeMap<String, f64>,
}

impl SubjectUpdate {
    pub fn player(uuid: &str, profile_id: &str) -> Self {
        SubjectUpdate {
            kind: SubjectKind::Player,
            subject_id: normalize_uuid(uuid),
            group_id: normalize_uuid(profile_id),
            ..Default::default()
        }
    }

    pub fn profile(profile_id: &str) -> Self {
        let profile_id = normalize_uuid(profile_id);
        SubjectUpdate {
            kind: SubjectKind::Profile,
            subject_id: profile_id.clone(),
            group_id: profile_id,
            ..Default::default()
        }
    }

    /// Every rankable attribute with its value. Raw upstream names win over cleaned
    /// ones so stats added upstream are ranked right away.
    pub fn candidate_attributes(&self) -> BTreeMap<String, f64> {
        let mut candidates = self.stats.clone();
        candidates.extend(
            self.collections
                .iter()
                .map(|(name, value)| (format!("collection_{}", name.to_lowercase()), *value)),
        );
        candidates.extend(
            self.skills
                .iter()
                .map(|(name, value)| (format!("skill_{}", name.to_lowercase()), *value)),
        );
        candidates.extend(
            self.slayers
                .iter()
                .map(|(name, value)| (format!("slayer_{}", name.to_lowercase()), *value)),
        );
        candidates.extend(self.raw_stats.iter().map(|(name, value)| (name.clone(), *value)));

        candidates.retain(|name, value| {
            value.is_finite()
                && *value > 0.0
                && name != LEADERBOARDS_COUNT
                && name != TOP_1_LEADERBOARDS_COUNT
        });
        candidates
    }

    /// Player update for `uuid` out of a profile document. `None` when not a member.
    pub fn from_profile_member(uuid: &str, profile: &Value) -> Option<Self> {
        let uuid = normalize_uuid(uuid);
        let member = &profile["members"][&uuid];
        let profile_id = profile["profile_id"].as_str()?;
        if !member.is_object() {
            return None;
        }

        let mut update = SubjectUpdate::player(&uuid, profile_id);
        update.raw_stats = numbers(&member["stats"]);
        update.collections = numbers(&member["collection"]);
        if let Some(member) = member.as_object() {
            update.skills = member
                .iter()
                .filter_map(|(name, value)| {
                    let skill = name.strip_prefix("experience_skill_")?;
                    Some((skill.to_string(), value.as_f64()?))
                })
                .collect();
            if let Some(fairy_souls) = member.get("fairy_souls_collected").and_then(Value::as_f64) {
                update
                    .stats
                    .insert("fairy_souls_collected".to_string(), fairy_souls);
            }
        }
        if let Some(bosses) = member["slayer_bosses"].as_object() {
            update.slayers = bosses
                .iter()
                .filter_map(|(boss, data)| Some((boss.clone(), data["xp"].as_f64()?)))
                .collect();
        }
        Some(update)
    }

    /// Profile wide update out of a profile document.
    pub fn from_profile(profile: &Value) -> Option<Self> {
        let mut update = SubjectUpdate::profile(profile["profile_id"].as_str()?);
        if let Some(bank) = profile["banking"]["balance"].as_f64() {
            update.stats.insert("bank".to_string(), bank);
        }
        if let Some(members) = profile["members"].as_object() {
            let minions = members
                .values()
                .filter_map(|member| member["crafted_generators"].as_array())
                .flatten()
                .filter_map(Value::as_str)
                .collect::<BTreeSet<&str>>();
            update
                .stats
                .insert("unique_minions".to_string(), minions.len() as f64);
            update
                .stats
                .insert("members_slots".to_string(), members.len() as f64);
        }
        Some(update)
    }
}

fn numbers(value: &Value) -> BTreeMap<String, f64> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(name, value)| Some((name.clone(), value.as_f64()?)))
                .collect()
        })
        .unwrap_or_default()
}
