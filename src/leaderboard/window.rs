use crate::leaderboard::attributes::LeaderboardAttribute;
use crate::storage::LeaderboardEntry;

/// Number of ranked places kept per attribute.
pub const WINDOW_SIZE: usize = 100;

/// The sorted top places of one attribute. Never longer than `WINDOW_SIZE`, with at
/// most one entry per subject.
#[derive(Debug, Clone)]
pub struct LeaderboardWindow {
    attribute: LeaderboardAttribute,
    entries: Vec<LeaderboardEntry>,
}

impl LeaderboardWindow {
    pub fn new(attribute: LeaderboardAttribute) -> Self {
        LeaderboardWindow {
            attribute,
            entries: Vec::with_capacity(WINDOW_SIZE),
        }
    }

    pub fn from_entries(attribute: LeaderboardAttribute, entries: Vec<LeaderboardEntry>) -> Self {
        let mut window = LeaderboardWindow::new(attribute);
        for entry in entries {
            window.upsert(entry);
        }
        window
    }

    pub fn attribute(&self) -> &LeaderboardAttribute {
        &self.attribute
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= WINDOW_SIZE
    }

    /// Value of the last place, once every place is taken.
    pub fn requirement(&self) -> Option<f64> {
        match self.is_full() {
            true => self.entries.last().map(|entry| entry.value),
            false => None,
        }
    }

    /// Whether `value` would make it into the window, ignoring the place the
    /// subject itself already holds.
    pub fn admits_subject(&self, subject_id: &str, group_id: &str, value: f64) -> bool {
        let last_other = self
            .entries
            .iter()
            .filter(|entry| !entry.is_subject(subject_id, group_id))
            .nth(WINDOW_SIZE - 1);
        match last_other {
            Some(entry) => self.attribute.beats(value, entry.value),
            None => true,
        }
    }

    /// Whether `value` would take the first place from every other subject.
    pub fn would_rank_first(&self, subject_id: &str, group_id: &str, value: f64) -> bool {
        match self
            .entries
            .iter()
            .find(|entry| !entry.is_subject(subject_id, group_id))
        {
            Some(first) => self.attribute.beats(value, first.value),
            None => true,
        }
    }

    /// Replace the subject's entry and keep the window sorted and bounded.
    /// Returns the 1-based position, `None` when the entry did not make it.
    pub fn upsert(&mut self, entry: LeaderboardEntry) -> Option<usize> {
        self.remove(&entry.subject_id, &entry.group_id);

        // Equal values keep their arrival order
        let index = self
            .entries
            .partition_point(|other| !self.attribute.beats(entry.value, other.value));
        if index >= WINDOW_SIZE {
            return None;
        }
        self.entries.insert(index, entry);
        self.entries.truncate(WINDOW_SIZE);
        Some(index + 1)
    }

    pub fn remove(&mut self, subject_id: &str, group_id: &str) -> Option<LeaderboardEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.is_subject(subject_id, group_id))?;
        Some(self.entries.remove(index))
    }

    /// 1-based position of the subject.
    pub fn position_of(&self, subject_id: &str, group_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_subject(subject_id, group_id))
            .map(|index| index + 1)
    }

    pub fn top(&self, offset: usize, limit: usize) -> &[LeaderboardEntry] {
        let start = offset.min(self.entries.len());
        let end = offset.saturating_add(limit).min(self.entries.len());
        &self.entries[start..end]
    }

    pub fn entries(&self) -> &[LeaderboardEntry] {
        &self.entries
    }
}
