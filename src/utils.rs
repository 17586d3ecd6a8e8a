use once_cell::sync::Lazy;
use regex::Regex;

// Minecraft uuids, with or without dashes
static REGEX_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{12}$")
        .unwrap()
});

pub fn is_uuid(input: &str) -> bool {
    REGEX_UUID.is_match(input)
}

/// Uuids are stored lowercase and without dashes, the way the game-stats API returns them.
pub fn normalize_uuid(input: &str) -> String {
    input.replace('-', "").to_lowercase()
}

/// Only keep the first and last characters of an API key, for logs and diagnostics.
pub fn mask_key(key: &str) -> String {
    let chars = key.chars().collect::<Vec<char>>();
    match chars.len() > 8 {
        true => format!(
            "{}...{}",
            chars[..4].iter().collect::<String>(),
            chars[chars.len() - 4..].iter().collect::<String>()
        ),
        false => "****".to_string(),
    }
}
