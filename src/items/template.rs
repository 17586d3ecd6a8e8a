use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;

pub const PLACEHOLDER: char = '?';

// Formatting code runs, words, then any single other character
static REGEX_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:§.)+|\w+|[^\w]").unwrap());

pub fn tokenize(text: &str) -> Vec<&str> {
    REGEX_TOKEN.find_iter(text).map(|m| m.as_str()).collect()
}

fn is_formatting(token: &str) -> bool {
    token.starts_with('§')
}

#[derive(Debug, PartialEq)]
enum Edit<'a> {
    Equal(&'a str),
    // Tokens of the template and of the new text differing at the same place
    Changed(Vec<&'a str>, Vec<&'a str>),
}

// Minimal edit script through the longest common subsequence
fn diff<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Edit<'a>> {
    let (n, m) = (old.len(), new.len());
    // lcs[i][j]: longest common subsequence of old[i..] and new[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = match old[i] == new[j] {
                true => lcs[i + 1][j + 1] + 1,
                false => lcs[i + 1][j].max(lcs[i][j + 1]),
            };
        }
    }

    let mut edits = Vec::new();
    let (mut removed, mut added) = (Vec::new(), Vec::new());
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && old[i] == new[j] {
            if !removed.is_empty() || !added.is_empty() {
                edits.push(Edit::Changed(
                    std::mem::take(&mut removed),
                    std::mem::take(&mut added),
                ));
            }
            edits.push(Edit::Equal(old[i]));
            i += 1;
            j += 1;
        } else if j < m && (i == n || lcs[i][j + 1] >= lcs[i + 1][j]) {
            added.push(new[j]);
            j += 1;
        } else {
            removed.push(old[i]);
            i += 1;
        }
    }
    if !removed.is_empty() || !added.is_empty() {
        edits.push(Edit::Changed(removed, added));
    }
    edits
}

fn text_len(tokens: &[&str]) -> usize {
    tokens
        .iter()
        .filter(|token| !is_formatting(token))
        .map(|token| token.chars().count())
        .sum()
}

/// Collapse the parts of `template` differing from `text` into `?` runs.
///
/// Each differing span becomes as many placeholders as the shorter of both sides,
/// formatting codes of the template being kept in place. A span with nothing to
/// collapse on one side is dropped.
pub fn reconcile(template: &str, text: &str) -> String {
    if template == text {
        return template.to_string();
    }
    let old = tokenize(template);
    let new = tokenize(text);

    diff(&old, &new)
        .into_iter()
        .map(|edit| match edit {
            Edit::Equal(token) => token.to_string(),
            Edit::Changed(removed, added) => {
                let width = text_len(&removed).min(text_len(&added));
                let mut placeholder = Some(PLACEHOLDER.to_string().repeat(width));
                removed
                    .iter()
                    .filter_map(|token| match is_formatting(token) {
                        true => Some(token.to_string()),
                        false => placeholder.take(),
                    })
                    .join("")
            }
        })
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_codes_and_punctuation_are_tokens() {
        assert_eq!(
            tokenize("§a§l[Lvl 1] Rabbit's"),
            vec!["§a§l", "[", "Lvl", " ", "1", "]", " ", "Rabbit", "'", "s"]
        );
    }

    #[test]
    fn variable_numbers_are_collapsed() {
        assert_eq!(reconcile("[Lvl 1] Rabbit", "[Lvl 99] Rabbit"), "[Lvl ?] Rabbit");
        assert_eq!(reconcile("[Lvl ?] Rabbit", "[Lvl 42] Rabbit"), "[Lvl ?] Rabbit");
        assert_eq!(
            reconcile("Kills: 1234", "Kills: 98"),
            "Kills: ??"
        );
    }

    #[test]
    fn identical_text_is_unchanged() {
        let template = "§6Aspect of the End\n§7Damage: §c+100";
        assert_eq!(reconcile(template, template), template);
    }

    #[test]
    fn template_formatting_codes_are_kept() {
        assert_eq!(
            reconcile("§7Owner: §aSteve", "§7Owner: §bAlex"),
            "§7Owner: §a????"
        );
    }

    #[test]
    fn insertions_without_template_text_are_dropped() {
        assert_eq!(reconcile("Rabbit", "Big Rabbit"), "Rabbit");
        assert_eq!(reconcile("Big Rabbit", "Rabbit"), "Rabbit");
    }
}
