use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde_json::json;
use tracing::{debug, info, warn};
use xp_core::{
    history::{self, DEFAULT_WINDOW_DAYS, MAX_WINDOW_DAYS},
    service::{DEFAULT_LOG_FILE, DEFAULT_TASKS_FILE},
    store::{CorruptPolicy, WritePolicy},
    token::TokenScheme,
    TrackerService,
};

use crate::cli::{CatalogCommand, Cli, Command, TaskArgs};
use crate::render;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) tasks_file: PathBuf,
    pub(crate) log_file: PathBuf,
    pub(crate) scheme: TokenScheme,
    pub(crate) history_days: u32,
    pub(crate) strict_storage: bool,
    pub(crate) last_writer_wins: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = lookup("XP_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("XP_TASKS_FILE") {
            config.tasks_file = PathBuf::from(file);
        }
        if let Some(file) = lookup("XP_LOG_FILE") {
            config.log_file = PathBuf::from(file);
        }
        if let Some(scheme) = lookup("XP_TOKEN_SCHEME") {
            config.scheme = scheme.parse().context("invalid XP_TOKEN_SCHEME")?;
        }
        if let Some(days) = lookup("XP_HISTORY_DAYS") {
            match days.trim().parse::<u32>() {
                Ok(value) if (1..=MAX_WINDOW_DAYS).contains(&value) => config.history_days = value,
                _ => warn!(value = %days, "ignoring invalid XP_HISTORY_DAYS"),
            }
        }
        if let Some(flag) = lookup("XP_STRICT_STORAGE") {
            config.strict_storage = parse_flag(&flag);
        }
        if let Some(flag) = lookup("XP_LAST_WRITER_WINS") {
            config.last_writer_wins = parse_flag(&flag);
        }
        Ok(config)
    }

    /// Command-line flags take precedence over the environment.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(scheme) = cli.scheme {
            self.scheme = scheme;
        }
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join(&self.tasks_file)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file)
    }

    pub fn open_service(&self) -> Result<TrackerService> {
        info!(
            tasks = %self.tasks_path().display(),
            log = %self.log_path().display(),
            scheme = %self.scheme,
            "opening tracker"
        );
        TrackerService::builder()
            .tasks_path(self.tasks_path())
            .log_path(self.log_path())
            .scheme(self.scheme)
            .corrupt_policy(if self.strict_storage {
                CorruptPolicy::Fail
            } else {
                CorruptPolicy::Fallback
            })
            .write_policy(if self.last_writer_wins {
                WritePolicy::LastWriterWins
            } else {
                WritePolicy::RejectStale
            })
            .build()
            .context("failed to initialize tracker")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            tasks_file: PathBuf::from(DEFAULT_TASKS_FILE),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            scheme: TokenScheme::default(),
            history_days: DEFAULT_WINDOW_DAYS,
            strict_storage: false,
            last_writer_wins: false,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn run(config: &AppConfig, command: &Command, json: bool, out: &mut dyn Write) -> Result<()> {
    let service = config.open_service()?;
    let app = TrackerApp {
        service,
        config,
        json,
    };
    app.dispatch(command, out)
}

struct TrackerApp<'a> {
    service: TrackerService,
    config: &'a AppConfig,
    json: bool,
}

impl TrackerApp<'_> {
    fn dispatch(&self, command: &Command, out: &mut dyn Write) -> Result<()> {
        debug!(?command, "dispatching");
        match command {
            Command::Show(args) => self.show(args.date.unwrap_or_else(today), out),
            Command::Check(args) => self.set_task(args, true, out),
            Command::Uncheck(args) => self.set_task(args, false, out),
            Command::Summary(args) => self.summary(args.date.unwrap_or_else(today), out),
            Command::History(args) => self.history(
                args.end.unwrap_or_else(today),
                args.days.unwrap_or(self.config.history_days),
                out,
            ),
            Command::Catalog(CatalogCommand::Show) => {
                writeln!(out, "{}", self.service.catalog_text()?)?;
                Ok(())
            }
            Command::Catalog(CatalogCommand::Replace { source }) => {
                self.replace_catalog(source, out)
            }
            Command::Doctor => self.doctor(out),
        }
    }

    fn show(&self, date: NaiveDate, out: &mut dyn Write) -> Result<()> {
        let catalog = self.service.catalog();
        let summary = self.service.summary(date);
        let done = self.service.completed(date);
        let is_done = |task: &xp_core::catalog::TaskRef| done.contains(&self.service.token_for(task, date));

        if self.json {
            let tasks: Vec<_> = catalog
                .slots()
                .into_iter()
                .map(|slot| {
                    json!({
                        "category": slot.task_ref.category,
                        "day": slot.task_ref.day,
                        "index": slot.task_ref.index,
                        "task": slot.task.label,
                        "xp": slot.task.xp,
                        "done": is_done(&slot.task_ref),
                    })
                })
                .collect();
            let payload = json!({ "summary": summary, "tasks": tasks });
            writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        } else {
            write!(out, "{}", render::board(&catalog, &summary, is_done))?;
        }
        Ok(())
    }

    fn set_task(&self, args: &TaskArgs, checked: bool, out: &mut dyn Write) -> Result<()> {
        let date = args.date.unwrap_or_else(today);
        let task = args.task_ref();
        let changed = self.service.set_task(date, &task, checked)?;
        self.service.commit(date)?;
        let summary = self.service.summary(date);
        info!(%task, %date, checked, changed, "task updated");

        if self.json {
            let payload = json!({ "task": task, "done": checked, "changed": changed, "summary": summary });
            writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
            return Ok(());
        }
        let state = if checked { "done" } else { "not done" };
        if changed {
            writeln!(out, "Saved {task} as {state} for {}", render::display_date(date))?;
        } else {
            writeln!(out, "{task} was already {state} for {}", render::display_date(date))?;
        }
        writeln!(out, "{}", render::summary_line(&summary))?;
        Ok(())
    }

    fn summary(&self, date: NaiveDate, out: &mut dyn Write) -> Result<()> {
        let summary = self.service.summary(date);
        if self.json {
            writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
        } else {
            writeln!(out, "{}", render::summary_line(&summary))?;
        }
        Ok(())
    }

    fn history(&self, end: NaiveDate, days: u32, out: &mut dyn Write) -> Result<()> {
        let rows = self.service.history(end, days);
        let totals = history::totals(&rows);
        if self.json {
            let payload = json!({ "rows": rows, "totals": totals });
            writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        } else {
            write!(out, "{}", render::history_table(&rows, &totals))?;
        }
        Ok(())
    }

    fn replace_catalog(&self, source: &str, out: &mut dyn Write) -> Result<()> {
        let text = if source == "-" {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("reading catalog from stdin")?;
            buffer
        } else {
            fs::read_to_string(source).with_context(|| format!("reading catalog from `{source}`"))?
        };
        self.service.replace_catalog_text(&text)?;
        writeln!(
            out,
            "{} saved ({} categories)",
            self.service.tasks_path().display(),
            self.service.categories().len()
        )?;
        Ok(())
    }

    fn doctor(&self, out: &mut dyn Write) -> Result<()> {
        let findings = self.service.audit();
        if self.json {
            writeln!(out, "{}", serde_json::to_string_pretty(&findings)?)?;
        } else {
            write!(out, "{}", render::audit_report(&findings))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{DateArgs, HistoryArgs};
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::tempdir;

    const CHORES: &str = r#"{"Chores": [{"task": "Dishes", "xp": 5}, {"task": "Trash", "xp": 3}]}"#;

    fn config_for(dir: &Path) -> AppConfig {
        AppConfig {
            data_dir: dir.to_path_buf(),
            ..AppConfig::default()
        }
    }

    fn exec(config: &AppConfig, command: Command, json: bool) -> Result<String> {
        let mut out = Vec::new();
        run(config, &command, json, &mut out)?;
        Ok(String::from_utf8(out).expect("utf8 output"))
    }

    fn date(raw: &str) -> Option<NaiveDate> {
        Some(raw.parse().unwrap())
    }

    #[test]
    fn config_reads_environment_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("XP_DATA_DIR", "/srv/xp"),
            ("XP_TOKEN_SCHEME", "date-independent"),
            ("XP_HISTORY_DAYS", "7"),
            ("XP_STRICT_STORAGE", "yes"),
        ]);
        let config = AppConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.scheme, TokenScheme::DateIndependent);
        assert_eq!(config.history_days, 7);
        assert!(config.strict_storage);
        assert!(!config.last_writer_wins);
        assert_eq!(config.tasks_path(), PathBuf::from("/srv/xp/tasks.json"));
        assert_eq!(config.log_path(), PathBuf::from("/srv/xp/daily_log.json"));
    }

    #[test]
    fn config_rejects_unknown_scheme_and_ignores_bad_window() {
        let bad = AppConfig::from_lookup(|key| (key == "XP_TOKEN_SCHEME").then(|| "weekly".to_string()));
        assert!(bad.is_err());

        let config = AppConfig::from_lookup(|key| (key == "XP_HISTORY_DAYS").then(|| "0".to_string())).unwrap();
        assert_eq!(config.history_days, DEFAULT_WINDOW_DAYS);
        let config =
            AppConfig::from_lookup(|key| (key == "XP_HISTORY_DAYS").then(|| "4000000000".to_string())).unwrap();
        assert_eq!(config.history_days, DEFAULT_WINDOW_DAYS);
    }

    #[test]
    fn check_then_show_and_history() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(DEFAULT_TASKS_FILE), CHORES).unwrap();
        let config = config_for(temp.path());

        let output = exec(
            &config,
            Command::Check(TaskArgs {
                category: "Chores".into(),
                index: 0,
                day: None,
                date: date("2024-01-30"),
            }),
            false,
        )
        .unwrap();
        assert!(output.contains("Saved Chores #0 as done for 30.01.2024"));
        assert!(output.contains("1 task(s) done, 5 XP"));

        let board = exec(&config, Command::Show(DateArgs { date: date("2024-01-30") }), false).unwrap();
        assert!(board.contains("[x] 0 Dishes (5 XP)"));
        assert!(board.contains("[ ] 1 Trash (3 XP)"));

        let table = exec(
            &config,
            Command::History(HistoryArgs {
                end: date("2024-01-30"),
                days: None,
            }),
            false,
        )
        .unwrap();
        // header + 30 rows + totals
        assert_eq!(table.lines().count(), 32);
        assert!(table.lines().nth(1).unwrap().starts_with("01.01.2024"));
    }

    #[test]
    fn check_of_missing_task_fails_without_touching_the_log() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(DEFAULT_TASKS_FILE), CHORES).unwrap();
        let config = config_for(temp.path());

        let err = exec(
            &config,
            Command::Check(TaskArgs {
                category: "Chores".into(),
                index: 9,
                day: None,
                date: date("2024-01-01"),
            }),
            false,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("out of range"));
        let log = fs::read_to_string(temp.path().join(DEFAULT_LOG_FILE)).unwrap();
        assert_eq!(log, "{}\n");
    }

    #[test]
    fn uncheck_removes_a_task_dropped_from_the_catalog() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(DEFAULT_TASKS_FILE), CHORES).unwrap();
        let config = config_for(temp.path());
        let trash = || TaskArgs {
            category: "Chores".into(),
            index: 1,
            day: None,
            date: date("2024-01-01"),
        };
        exec(&config, Command::Check(trash()), false).unwrap();

        fs::write(
            temp.path().join(DEFAULT_TASKS_FILE),
            r#"{"Chores": [{"task": "Dishes", "xp": 5}]}"#,
        )
        .unwrap();
        let output = exec(&config, Command::Uncheck(trash()), false).unwrap();
        assert!(output.starts_with("Saved Chores #1 as not done for 01.01.2024"));
        let log = fs::read_to_string(temp.path().join(DEFAULT_LOG_FILE)).unwrap();
        assert_eq!(log, "{\n  \"2024-01-01\": []\n}\n");
    }

    #[test]
    fn catalog_replace_from_file_and_doctor_reports_dangling_tokens() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(DEFAULT_TASKS_FILE), CHORES).unwrap();
        fs::write(
            temp.path().join(DEFAULT_LOG_FILE),
            r#"{"2024-01-01": ["Chores_1_2024-01-01"]}"#,
        )
        .unwrap();
        let config = config_for(temp.path());

        let edit = temp.path().join("edit.json");
        fs::write(&edit, r#"{"Chores": [{"task": "Dishes", "xp": 5}]}"#).unwrap();
        let output = exec(
            &config,
            Command::Catalog(CatalogCommand::Replace {
                source: edit.display().to_string(),
            }),
            false,
        )
        .unwrap();
        assert!(output.contains("saved (1 categories)"));

        let report = exec(&config, Command::Doctor, true).unwrap();
        let findings: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert_eq!(findings.as_array().map(Vec::len), Some(1));
        assert_eq!(findings[0]["token"], "Chores_1_2024-01-01");

        let summary = exec(&config, Command::Summary(DateArgs { date: date("2024-01-01") }), true).unwrap();
        let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(summary["count"], 1);
        assert_eq!(summary["xp"], 0);
    }

    #[test]
    fn invalid_catalog_edit_is_reported_and_ignored() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(DEFAULT_TASKS_FILE), CHORES).unwrap();
        let config = config_for(temp.path());
        let edit = temp.path().join("edit.json");
        fs::write(&edit, r#"{"Chores": [{"task": "Dishes"}]}"#).unwrap();

        let err = exec(
            &config,
            Command::Catalog(CatalogCommand::Replace {
                source: edit.display().to_string(),
            }),
            false,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("catalog edit rejected"));

        let shown = exec(&config, Command::Catalog(CatalogCommand::Show), false).unwrap();
        assert!(shown.contains("Trash"));
    }
}
