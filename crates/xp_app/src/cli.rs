use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use xp_core::{catalog::TaskRef, history::MAX_WINDOW_DAYS, token::TokenScheme};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "xptrack: recurring tasks, daily XP",
    long_about = None
)]
pub struct Cli {
    /// Directory holding tasks.json and daily_log.json.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Token encoding used by this deployment (date-scoped or date-independent).
    #[arg(long, global = true)]
    pub scheme: Option<TokenScheme>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List every task with its state for a date.
    Show(DateArgs),
    /// Mark a task done and save.
    Check(TaskArgs),
    /// Mark a task not done and save.
    Uncheck(TaskArgs),
    /// Completed tasks and XP for a date.
    Summary(DateArgs),
    /// Per-day completions and XP, oldest first.
    History(HistoryArgs),
    /// Inspect or replace tasks.json.
    #[command(subcommand)]
    Catalog(CatalogCommand),
    /// List logged tokens that no longer match a task.
    Doctor,
}

#[derive(Args, Debug, Default)]
pub struct DateArgs {
    /// Day to act on (YYYY-MM-DD), defaults to today.
    #[arg(long)]
    pub date: Option<NaiveDate>,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    pub category: String,
    /// Position of the task in its list, starting at 0.
    pub index: usize,
    /// Day label for weekly-plan categories.
    #[arg(long)]
    pub day: Option<String>,
    #[arg(long)]
    pub date: Option<NaiveDate>,
}

impl TaskArgs {
    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            category: self.category.clone(),
            day: self.day.clone(),
            index: self.index,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct HistoryArgs {
    /// Last day of the window, defaults to today.
    #[arg(long)]
    pub end: Option<NaiveDate>,
    /// Window length in days.
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=i64::from(MAX_WINDOW_DAYS)))]
    pub days: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// Print the catalog as JSON.
    Show,
    /// Replace the catalog with the JSON in FILE (`-` reads stdin).
    Replace { source: String },
}
