use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::store::{JsonStore, LoadOrigin, Revision, StoreError};

static NOTHING_DONE: BTreeSet<String> = BTreeSet::new();

/// Read access to per-date completion sets.
pub trait CompletionSource {
    /// Tokens completed on `date`. Dates without an entry are empty.
    fn get_completed(&self, date: NaiveDate) -> &BTreeSet<String>;

    /// Every date that has an entry, ascending.
    fn dates(&self) -> Vec<NaiveDate>;
}

/// The on-disk log: ISO date to the set of tokens completed that day.
///
/// Keys that are not valid dates are kept aside and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionLog {
    days: BTreeMap<NaiveDate, BTreeSet<String>>,
    unreadable: BTreeMap<String, BTreeSet<String>>,
}

impl Serialize for CompletionLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut entries: BTreeMap<String, &BTreeSet<String>> = self
            .unreadable
            .iter()
            .map(|(key, tokens)| (key.clone(), tokens))
            .collect();
        entries.extend(self.days.iter().map(|(date, tokens)| (date.to_string(), tokens)));
        entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CompletionLog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, BTreeSet<String>>::deserialize(deserializer)?;
        let mut log = CompletionLog::default();
        for (key, tokens) in raw {
            match key.parse::<NaiveDate>() {
                Ok(date) => log.days.entry(date).or_default().extend(tokens),
                Err(err) => {
                    tracing::debug!(%key, %err, "log key is not a date");
                    log.unreadable.insert(key, tokens);
                }
            }
        }
        Ok(log)
    }
}

impl CompletionLog {
    pub fn set(&mut self, date: NaiveDate, tokens: BTreeSet<String>) {
        self.days.insert(date, tokens);
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, &BTreeSet<String>)> {
        self.days.iter().map(|(date, tokens)| (*date, tokens))
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty() && self.unreadable.is_empty()
    }

    pub fn unreadable_keys(&self) -> impl Iterator<Item = &str> {
        self.unreadable.keys().map(String::as_str)
    }
}

impl CompletionSource for CompletionLog {
    fn get_completed(&self, date: NaiveDate) -> &BTreeSet<String> {
        self.days.get(&date).unwrap_or(&NOTHING_DONE)
    }

    fn dates(&self) -> Vec<NaiveDate> {
        self.days.keys().copied().collect()
    }
}

/// The completion log plus uncommitted toggles, persisted on [`commit`].
///
/// [`commit`]: CompletionTracker::commit
#[derive(Debug)]
pub struct CompletionTracker {
    path: PathBuf,
    store: JsonStore,
    committed: CompletionLog,
    revision: Revision,
    working: BTreeMap<NaiveDate, BTreeSet<String>>,
}

impl CompletionTracker {
    /// Loads the log at `path`, writing an empty one when there is no readable file.
    pub fn open(store: JsonStore, path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let loaded = store.load(&path, CompletionLog::default())?;
        let mut tracker = Self {
            path,
            store,
            committed: loaded.value,
            revision: loaded.revision,
            working: BTreeMap::new(),
        };
        let unreadable = tracker.committed.unreadable.len();
        if unreadable > 0 {
            tracing::warn!(
                path = %tracker.path.display(),
                unreadable,
                "completion log has entries whose key is not a date; they are kept but ignored"
            );
        }
        if matches!(
            loaded.origin,
            LoadOrigin::Missing | LoadOrigin::Recovered { backup: Some(_) }
        ) {
            tracker.revision = store.save(&tracker.path, &tracker.committed, tracker.revision)?;
            tracing::info!(path = %tracker.path.display(), "initialised empty completion log");
        }
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// The log as last committed, without pending toggles.
    pub fn committed(&self) -> &CompletionLog {
        &self.committed
    }

    /// Marks `token` done or not done on `date`. Returns whether the set changed.
    pub fn toggle(&mut self, date: NaiveDate, token: &str, checked: bool) -> bool {
        let committed = &self.committed;
        let tokens = self
            .working
            .entry(date)
            .or_insert_with(|| committed.get_completed(date).clone());
        if checked {
            tokens.insert(token.to_string())
        } else {
            tokens.remove(token)
        }
    }

    /// Replaces the stored set for `date` with the current one and persists
    /// the log. Nothing changes in memory if the save fails.
    pub fn commit(&mut self, date: NaiveDate) -> Result<(), StoreError> {
        let mut next = self.committed.clone();
        next.set(date, self.get_completed(date).clone());
        let revision = self.store.save(&self.path, &next, self.revision)?;
        self.committed = next;
        self.revision = revision;
        self.working.remove(&date);
        tracing::debug!(%date, done = self.committed.get_completed(date).len(), "committed completions");
        Ok(())
    }

    /// Drops uncommitted toggles for `date`.
    pub fn discard(&mut self, date: NaiveDate) -> bool {
        self.working.remove(&date).is_some()
    }

    /// Dates whose pending set differs from the committed one.
    pub fn dirty_dates(&self) -> Vec<NaiveDate> {
        self.working
            .iter()
            .filter(|(date, tokens)| self.committed.get_completed(**date) != *tokens)
            .map(|(date, _)| *date)
            .collect()
    }
}

impl CompletionSource for CompletionTracker {
    fn get_completed(&self, date: NaiveDate) -> &BTreeSet<String> {
        match self.working.get(&date) {
            Some(tokens) => tokens,
            None => self.committed.get_completed(date),
        }
    }

    fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: BTreeSet<NaiveDate> = self.committed.dates().into_iter().collect();
        dates.extend(self.working.keys().copied());
        dates.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn day(raw: &str) -> NaiveDate {
        raw.parse().unwrap()
    }

    #[test]
    fn first_open_writes_an_empty_log() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("daily_log.json");
        let tracker = CompletionTracker::open(JsonStore::default(), &path).unwrap();
        assert!(tracker.committed().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}\n");
    }

    #[test]
    fn unknown_dates_are_empty() {
        let log = CompletionLog::default();
        assert!(log.get_completed(day("1999-12-31")).is_empty());
    }

    #[test]
    fn toggle_is_idempotent_and_reversible() {
        let temp = tempdir().unwrap();
        let mut tracker =
            CompletionTracker::open(JsonStore::default(), temp.path().join("log.json")).unwrap();
        let date = day("2024-03-04");
        let before = tracker.get_completed(date).clone();

        assert!(tracker.toggle(date, "Chores_0", true));
        assert!(!tracker.toggle(date, "Chores_0", true));
        assert_eq!(tracker.get_completed(date).len(), 1);
        assert_eq!(tracker.dirty_dates(), vec![date]);

        assert!(tracker.toggle(date, "Chores_0", false));
        assert!(!tracker.toggle(date, "Chores_0", false));
        assert_eq!(tracker.get_completed(date), &before);
        assert!(tracker.dirty_dates().is_empty());
    }

    #[test]
    fn commit_replaces_the_stored_set_and_survives_reload() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("log.json");
        let date = day("2024-01-01");

        let mut tracker = CompletionTracker::open(JsonStore::default(), &path).unwrap();
        tracker.toggle(date, "Chores_0_2024-01-01", true);
        tracker.toggle(date, "Chores_1_2024-01-01", true);
        tracker.commit(date).unwrap();

        tracker.toggle(date, "Chores_1_2024-01-01", false);
        tracker.commit(date).unwrap();

        let reopened = CompletionTracker::open(JsonStore::default(), &path).unwrap();
        let expected: BTreeSet<String> = ["Chores_0_2024-01-01".to_string()].into();
        assert_eq!(reopened.get_completed(date), &expected);
        assert_eq!(reopened.revision(), tracker.revision());
    }

    #[test]
    fn discard_restores_the_committed_set() {
        let temp = tempdir().unwrap();
        let mut tracker =
            CompletionTracker::open(JsonStore::default(), temp.path().join("log.json")).unwrap();
        let date = day("2024-01-02");
        tracker.toggle(date, "A_0", true);
        assert!(tracker.discard(date));
        assert!(tracker.get_completed(date).is_empty());
        assert!(!tracker.discard(date));
    }

    #[test]
    fn bad_date_keys_do_not_discard_the_rest_of_the_log() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("log.json");
        fs::write(
            &path,
            r#"{"2024-01-01": ["Chores_0_2024-01-01"], "2024-13-02": ["Chores_1"]}"#,
        )
        .unwrap();

        let mut tracker = CompletionTracker::open(JsonStore::default(), &path).unwrap();
        let date = day("2024-01-01");
        assert_eq!(tracker.get_completed(date).len(), 1);
        assert_eq!(tracker.dates(), vec![date]);
        assert_eq!(
            tracker.committed().unreadable_keys().collect::<Vec<_>>(),
            vec!["2024-13-02"]
        );
        assert!(fs::read_dir(temp.path())
            .unwrap()
            .all(|entry| !entry.unwrap().file_name().to_string_lossy().contains("corrupt")));

        tracker.toggle(date, "Chores_1_2024-01-01", true);
        tracker.commit(date).unwrap();
        let saved = fs::read_to_string(&path).unwrap();
        assert!(saved.contains("\"2024-13-02\""));
        assert!(saved.contains("Chores_1_2024-01-01"));
    }

    #[test]
    fn recovered_log_is_recreated_on_disk() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("log.json");
        fs::write(&path, "{ not json").unwrap();

        let mut tracker = CompletionTracker::open(JsonStore::default(), &path).unwrap();
        assert!(tracker.committed().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}\n");

        let date = day("2024-01-01");
        tracker.toggle(date, "A_0", true);
        tracker.commit(date).unwrap();
        let reopened = CompletionTracker::open(JsonStore::default(), &path).unwrap();
        assert!(reopened.get_completed(date).contains("A_0"));
    }

    #[test]
    fn duplicates_on_disk_collapse_into_a_set() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("log.json");
        fs::write(&path, r#"{"2024-01-01": ["A_0", "A_0", "A_1"]}"#).unwrap();
        let tracker = CompletionTracker::open(JsonStore::default(), &path).unwrap();
        assert_eq!(tracker.get_completed(day("2024-01-01")).len(), 2);
        assert_eq!(tracker.dates(), vec![day("2024-01-01")]);
    }
}
