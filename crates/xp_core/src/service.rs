use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::instrument;

use crate::{
    aggregate::{DaySummary, UnresolvedToken, XpAggregator},
    catalog::{CategoryTasks, TaskCatalog, TaskRef},
    completion::{CompletionSource, CompletionTracker},
    history,
    store::{CorruptPolicy, JsonStore, LoadOrigin, Revision, WritePolicy},
    token::TokenScheme,
};

pub const DEFAULT_TASKS_FILE: &str = "tasks.json";
pub const DEFAULT_LOG_FILE: &str = "daily_log.json";

struct CatalogState {
    catalog: TaskCatalog,
    revision: Revision,
}

pub struct TrackerService {
    tasks_path: PathBuf,
    scheme: TokenScheme,
    store: JsonStore,
    catalog: RwLock<CatalogState>,
    completions: RwLock<CompletionTracker>,
}

pub struct TrackerServiceBuilder {
    tasks_path: PathBuf,
    log_path: PathBuf,
    scheme: TokenScheme,
    corrupt_policy: CorruptPolicy,
    write_policy: WritePolicy,
    lock_timeout: Option<Duration>,
}

impl Default for TrackerServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerServiceBuilder {
    pub fn new() -> Self {
        Self {
            tasks_path: PathBuf::from(DEFAULT_TASKS_FILE),
            log_path: PathBuf::from(DEFAULT_LOG_FILE),
            scheme: TokenScheme::default(),
            corrupt_policy: CorruptPolicy::default(),
            write_policy: WritePolicy::default(),
            lock_timeout: None,
        }
    }

    /// Places both documents under `dir` with their default file names.
    pub fn data_dir(self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.tasks_path(dir.join(DEFAULT_TASKS_FILE))
            .log_path(dir.join(DEFAULT_LOG_FILE))
    }

    pub fn tasks_path(mut self, path: impl AsRef<Path>) -> Self {
        self.tasks_path = path.as_ref().to_path_buf();
        self
    }

    pub fn log_path(mut self, path: impl AsRef<Path>) -> Self {
        self.log_path = path.as_ref().to_path_buf();
        self
    }

    pub fn scheme(mut self, scheme: TokenScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn corrupt_policy(mut self, policy: CorruptPolicy) -> Self {
        self.corrupt_policy = policy;
        self
    }

    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<TrackerService> {
        let mut store = JsonStore::new(self.corrupt_policy, self.write_policy);
        if let Some(timeout) = self.lock_timeout {
            store = store.with_lock_timeout(timeout);
        }

        let catalog = load_catalog(&store, &self.tasks_path)?;
        let completions = CompletionTracker::open(store, &self.log_path)
            .with_context(|| format!("opening completion log `{}`", self.log_path.display()))?;

        Ok(TrackerService {
            tasks_path: self.tasks_path,
            scheme: self.scheme,
            store,
            catalog: RwLock::new(catalog),
            completions: RwLock::new(completions),
        })
    }
}

fn load_catalog(store: &JsonStore, path: &Path) -> Result<CatalogState> {
    let loaded = store
        .load(path, TaskCatalog::default())
        .with_context(|| format!("loading task catalog `{}`", path.display()))?;
    if let Err(err) = loaded.value.validate() {
        tracing::warn!(path = %path.display(), %err, "task catalog breaks naming rules; some tasks may never resolve");
    }
    if let LoadOrigin::Recovered { backup } = &loaded.origin {
        tracing::warn!(path = %path.display(), backup = ?backup, "task catalog was unreadable and has been reset");
    }
    Ok(CatalogState {
        catalog: loaded.value,
        revision: loaded.revision,
    })
}

impl TrackerService {
    pub fn builder() -> TrackerServiceBuilder {
        TrackerServiceBuilder::new()
    }

    pub fn scheme(&self) -> TokenScheme {
        self.scheme
    }

    pub fn tasks_path(&self) -> &Path {
        &self.tasks_path
    }

    pub fn log_path(&self) -> PathBuf {
        self.completions.read().path().to_path_buf()
    }

    pub fn categories(&self) -> Vec<String> {
        self.catalog.read().catalog.categories()
    }

    pub fn tasks(&self, category: &str) -> Option<CategoryTasks> {
        self.catalog.read().catalog.tasks(category).cloned()
    }

    pub fn catalog(&self) -> TaskCatalog {
        self.catalog.read().catalog.clone()
    }

    /// The catalog as editable pretty JSON.
    pub fn catalog_text(&self) -> Result<String> {
        Ok(self.catalog.read().catalog.to_pretty_json()?)
    }

    /// Validates and saves `catalog`, then swaps it in. A rejected edit leaves
    /// the current catalog untouched.
    #[instrument(skip(self, catalog))]
    pub fn replace_catalog(&self, catalog: TaskCatalog) -> Result<()> {
        catalog.validate().context("catalog edit rejected")?;
        let mut state = self.catalog.write();
        let revision = self
            .store
            .save(&self.tasks_path, &catalog, state.revision)
            .with_context(|| format!("saving task catalog `{}`", self.tasks_path.display()))?;
        tracing::info!(categories = catalog.categories().len(), "task catalog replaced");
        state.catalog.replace(catalog);
        state.revision = revision;
        Ok(())
    }

    pub fn replace_catalog_text(&self, text: &str) -> Result<()> {
        let catalog = TaskCatalog::parse(text).context("catalog edit rejected")?;
        self.replace_catalog(catalog)
    }

    /// Re-reads the catalog from disk, picking up edits made outside the service.
    #[instrument(skip(self))]
    pub fn reload_catalog(&self) -> Result<()> {
        let fresh = load_catalog(&self.store, &self.tasks_path)?;
        *self.catalog.write() = fresh;
        Ok(())
    }

    pub fn token_for(&self, task: &TaskRef, date: NaiveDate) -> String {
        self.scheme.encode(task, date)
    }

    pub fn completed(&self, date: NaiveDate) -> BTreeSet<String> {
        self.completions.read().get_completed(date).clone()
    }

    pub fn toggle(&self, date: NaiveDate, token: &str, checked: bool) -> bool {
        self.completions.write().toggle(date, token, checked)
    }

    /// Toggles a catalog task. Fails if `task` does not exist in the catalog.
    /// Checking requires `task` to exist; unchecking also clears tokens left behind by catalog edits.
    pub fn set_task(&self, date: NaiveDate, task: &TaskRef, checked: bool) -> Result<bool> {
        if checked {
            self.catalog
                .read()
                .catalog
                .lookup(task)
                .with_context(|| format!("no task {task}"))?;
        }
        let token = self.token_for(task, date);
        Ok(self.toggle(date, &token, checked))
    }

    pub fn is_task_done(&self, date: NaiveDate, task: &TaskRef) -> bool {
        let token = self.token_for(task, date);
        self.completions.read().get_completed(date).contains(&token)
    }

    #[instrument(skip(self))]
    pub fn commit(&self, date: NaiveDate) -> Result<()> {
        self.completions
            .write()
            .commit(date)
            .with_context(|| format!("saving completions for {date}"))
    }

    pub fn discard(&self, date: NaiveDate) -> bool {
        self.completions.write().discard(date)
    }

    pub fn dirty_dates(&self) -> Vec<NaiveDate> {
        self.completions.read().dirty_dates()
    }

    pub fn summary(&self, date: NaiveDate) -> DaySummary {
        let catalog = self.catalog.read();
        let completions = self.completions.read();
        XpAggregator::new(&catalog.catalog, &*completions, self.scheme).summary(date)
    }

    pub fn xp_for(&self, date: NaiveDate) -> u64 {
        self.summary(date).xp
    }

    pub fn count_for(&self, date: NaiveDate) -> usize {
        self.completions.read().get_completed(date).len()
    }

    #[instrument(skip(self))]
    pub fn history(&self, end: NaiveDate, window: u32) -> Vec<DaySummary> {
        let catalog = self.catalog.read();
        let completions = self.completions.read();
        let aggregator = XpAggregator::new(&catalog.catalog, &*completions, self.scheme);
        history::report(&aggregator, end, window)
    }

    pub fn audit(&self) -> Vec<UnresolvedToken> {
        let catalog = self.catalog.read();
        let completions = self.completions.read();
        XpAggregator::new(&catalog.catalog, &*completions, self.scheme).audit()
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
    fn set_task_refuses_tasks_missing_from_the_catalog() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join(DEFAULT_TASKS_FILE),
            r#"{"Chores": [{"task": "Dishes", "xp": 5}]}"#,
        )
        .unwrap();
        let service = TrackerService::builder().data_dir(temp.path()).build().unwrap();
        let date = day("2024-01-01");

        assert!(service.set_task(date, &TaskRef::flat("Chores", 0), true).unwrap());
        assert!(service.is_task_done(date, &TaskRef::flat("Chores", 0)));
        assert!(service.set_task(date, &TaskRef::flat("Chores", 4), true).is_err());
        assert_eq!(service.dirty_dates(), vec![date]);
    }

    #[test]
    fn uncheck_clears_a_token_the_catalog_no_longer_has() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join(DEFAULT_TASKS_FILE),
            r#"{"Chores": [{"task": "Dishes", "xp": 5}, {"task": "Trash", "xp": 3}]}"#,
        )
        .unwrap();
        let service = TrackerService::builder().data_dir(temp.path()).build().unwrap();
        let date = day("2024-01-01");
        let trash = TaskRef::flat("Chores", 1);
        service.set_task(date, &trash, true).unwrap();
        service.commit(date).unwrap();

        service
            .replace_catalog_text(r#"{"Chores": [{"task": "Dishes", "xp": 5}]}"#)
            .unwrap();
        assert_eq!(service.audit().len(), 1);

        assert!(service.set_task(date, &trash, false).unwrap());
        service.commit(date).unwrap();
        assert!(service.audit().is_empty());
        assert_eq!(service.count_for(date), 0);
        assert!(!service.set_task(date, &trash, false).unwrap());
    }

    #[test]
    fn rejected_edit_keeps_the_current_catalog() {
        let temp = tempdir().unwrap();
        let service = TrackerService::builder().data_dir(temp.path()).build().unwrap();
        service
            .replace_catalog_text(r#"{"Chores": [{"task": "Dishes", "xp": 5}]}"#)
            .unwrap();

        let err = service.replace_catalog_text("{ broken").unwrap_err();
        assert!(format!("{err:#}").contains("catalog edit rejected"));
        let err = service
            .replace_catalog_text(r#"{"Morning_Routine": []}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("reserved separator"));

        assert_eq!(service.categories(), vec!["Chores"]);
        let on_disk = fs::read_to_string(temp.path().join(DEFAULT_TASKS_FILE)).unwrap();
        assert!(on_disk.contains("Dishes"));
    }
}
