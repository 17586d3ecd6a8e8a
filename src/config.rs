use crate::cli::Cli;
use crate::error::StatsResult;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

const TRACE_LEVELS: [&'static str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
const LOCAL_SETTINGS_YAML_FILE: &str = ".env.local.yaml";

// All settings may be configured via environment variables. Example:
// API_KEYS="xxx,yyy" would set api_keys to the xxx,yyy value.
// Settings are loaded once at startup and handed to the services that need them.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    #[serde(default = "default_trace_level")]
    trace_level: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_mojang_base_url")]
    pub mojang_base_url: String,
    #[serde(default = "default_api_timeout_sec")]
    pub api_timeout_sec: u64,
    // Comma separated list of upstream API keys
    #[serde(default)]
    api_keys: String,
    // Number of keys considered at each selection, the rest stay in reserve
    #[serde(default = "default_api_key_pool_size")]
    pub api_key_pool_size: usize,
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    #[serde(default = "default_throttle_cooldown_sec")]
    pub throttle_cooldown_sec: u64,
    #[serde(default = "default_disabled_cooldown_sec")]
    pub disabled_cooldown_sec: u64,
    #[serde(default = "default_cache_sweep_schedule")]
    pub cache_sweep_schedule: String,
    #[serde(default = "default_leaderboard_sweep_schedule")]
    pub leaderboard_sweep_schedule: String,
    #[serde(default = "default_leaderboard_sweep_delay_ms")]
    pub leaderboard_sweep_delay_ms: u64,
    #[serde(default = "default_leaderboard_debounce_sec")]
    pub leaderboard_debounce_sec: u64,
    // "memory" keeps leaderboards and item identities in process, "none" disables them
    #[serde(default = "default_store")]
    pub store: String,
    // Startup options coming from the command line
    #[serde(default)]
    pub players: Vec<String>,
    #[serde(default)]
    pub once: bool,
}

impl Settings {
    pub fn load(cli: &Cli) -> StatsResult<Self> {
        let figment = match Path::new(LOCAL_SETTINGS_YAML_FILE).exists() {
            true => {
                println!(
                    "\n######################################\n\
                       ##   Found '.env.local.yaml' file,  ##\n\
                       ##   loading local configuration.   ##\n\
                       ######################################\n\
                    "
                );
                Figment::new()
                    .merge(Yaml::file(LOCAL_SETTINGS_YAML_FILE))
                    .merge(Env::raw())
            }
            false => Figment::new().merge(Env::raw()),
        };

        Self::from_figment(figment.merge(Serialized::defaults(cli)))
    }

    pub fn from_figment(figment: Figment) -> StatsResult<Self> {
        Ok(figment.extract()?)
    }

    pub fn get_trace_level(&self) -> Level {
        get_trace_level(&self.trace_level)
    }

    pub fn api_keys(&self) -> Vec<String> {
        self.api_keys
            .split(',')
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect()
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_sec)
    }

    pub fn throttle_cooldown(&self) -> Duration {
        Duration::from_secs(self.throttle_cooldown_sec)
    }

    pub fn disabled_cooldown(&self) -> Duration {
        Duration::from_secs(self.disabled_cooldown_sec)
    }

    pub fn leaderboard_debounce(&self) -> Duration {
        Duration::from_secs(self.leaderboard_debounce_sec)
    }

    pub fn leaderboard_sweep_delay(&self) -> Duration {
        Duration::from_millis(self.leaderboard_sweep_delay_ms)
    }
}

fn get_trace_level(level_str: &str) -> Level {
    match level_str {
        level if level == TRACE_LEVELS[0] => Level::TRACE,
        level if level == TRACE_LEVELS[1] => Level::DEBUG,
        level if level == TRACE_LEVELS[2] => Level::INFO,
        level if level == TRACE_LEVELS[3] => Level::WARN,
        level if level == TRACE_LEVELS[4] => Level::ERROR,
        // Default trace level
        _ => Level::INFO,
    }
}

fn default_trace_level() -> String {
    "INFO".to_string()
}

fn default_api_base_url() -> String {
    "https://api.hypixel.net".to_string()
}

fn default_mojang_base_url() -> String {
    "https://api.mojang.com".to_string()
}

fn default_api_timeout_sec() -> u64 {
    5
}

fn default_api_key_pool_size() -> usize {
    5
}

fn default_transport_retries() -> u32 {
    3
}

fn default_throttle_cooldown_sec() -> u64 {
    10
}

fn default_disabled_cooldown_sec() -> u64 {
    30
}

fn default_cache_sweep_schedule() -> String {
    // Every minute
    "0 * * * * *".to_string()
}

fn default_leaderboard_sweep_schedule() -> String {
    // Every hour
    "0 0 * * * *".to_string()
}

fn default_leaderboard_sweep_delay_ms() -> u64 {
    250
}

fn default_leaderboard_debounce_sec() -> u64 {
    180
}

fn default_store() -> String {
    "memory".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_any_provider() {
        let settings = Settings::from_figment(Figment::new()).unwrap();
        assert_eq!(settings.api_base_url, "https://api.hypixel.net");
        assert_eq!(settings.throttle_cooldown(), Duration::from_secs(10));
        assert_eq!(settings.disabled_cooldown(), Duration::from_secs(30));
        assert_eq!(settings.leaderboard_debounce(), Duration::from_secs(180));
        assert_eq!(settings.get_trace_level(), Level::INFO);
        assert!(settings.api_keys().is_empty());
    }

    #[test]
    fn api_keys_are_split_and_trimmed() {
        let figment = Figment::new().merge(Serialized::default("api_keys", "a, b,,c "));
        let settings = Settings::from_figment(figment).unwrap();
        assert_eq!(settings.api_keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cli_options_are_merged() {
        let cli = Cli {
            players: vec!["Technoblade".to_string()],
            once: true,
        };
        let settings =
            Settings::from_figment(Figment::new().merge(Serialized::defaults(&cli))).unwrap();
        assert_eq!(settings.players, vec!["Technoblade"]);
        assert!(settings.once);
    }

    #[test]
    fn unknown_trace_level_falls_back_to_info() {
        assert_eq!(get_trace_level("LOUD"), Level::INFO);
        assert_eq!(get_trace_level("DEBUG"), Level::DEBUG);
    }
}
