use std::fmt::Write;

use chrono::NaiveDate;
use xp_core::{
    aggregate::{DaySummary, UnresolvedToken},
    catalog::{CategoryTasks, Task, TaskCatalog, TaskRef},
    history::HistoryTotals,
};

const DISPLAY_DATE: &str = "%d.%m.%Y";

pub fn display_date(date: NaiveDate) -> String {
    date.format(DISPLAY_DATE).to_string()
}

pub fn board(
    catalog: &TaskCatalog,
    summary: &DaySummary,
    is_done: impl Fn(&TaskRef) -> bool,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Tasks for {}", display_date(summary.date));
    if catalog.is_empty() {
        out.push_str("(no tasks defined, see `xptrack catalog replace`)\n");
    }

    for (category, tasks) in catalog.entries() {
        let _ = writeln!(out, "== {category}");
        match tasks {
            CategoryTasks::Flat(list) => {
                task_lines(&mut out, "  ", list, |index| {
                    is_done(&TaskRef::flat(category, index))
                });
            }
            CategoryTasks::Weekly(days) => {
                for (day, list) in days.iter() {
                    let _ = writeln!(out, "  -- {day}");
                    task_lines(&mut out, "    ", list, |index| {
                        is_done(&TaskRef::weekly(category, day, index))
                    });
                }
            }
        }
    }

    let _ = writeln!(
        out,
        "Done: {} task(s), {} / {} XP",
        summary.count,
        summary.xp,
        catalog.total_xp()
    );
    if summary.unresolved > 0 {
        let _ = writeln!(
            out,
            "({} logged token(s) no longer match a task, run `xptrack doctor`)",
            summary.unresolved
        );
    }
    out
}

fn task_lines(out: &mut String, indent: &str, tasks: &[Task], done: impl Fn(usize) -> bool) {
    for (index, task) in tasks.iter().enumerate() {
        let mark = if done(index) { 'x' } else { ' ' };
        let _ = writeln!(out, "{indent}[{mark}] {index} {} ({} XP)", task.label, task.xp);
    }
}

pub fn summary_line(summary: &DaySummary) -> String {
    let mut line = format!(
        "{}: {} task(s) done, {} XP",
        display_date(summary.date),
        summary.count,
        summary.xp
    );
    if summary.unresolved > 0 {
        let _ = write!(line, ", {} unresolved", summary.unresolved);
    }
    line
}

pub fn history_table(rows: &[DaySummary], totals: &HistoryTotals) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<10}  {:>6}  {:>6}", "Date", "Done", "XP");
    for row in rows {
        let _ = writeln!(
            out,
            "{:<10}  {:>6}  {:>6}",
            display_date(row.date),
            row.count,
            row.xp
        );
    }
    let _ = writeln!(
        out,
        "{:<10}  {:>6}  {:>6}  ({} of {} days active)",
        "Total", totals.count, totals.xp, totals.active_days, totals.days
    );
    out
}

pub fn audit_report(findings: &[UnresolvedToken]) -> String {
    if findings.is_empty() {
        return "All logged tokens match a task.\n".to_string();
    }
    let mut out = format!("{} unresolved token(s):\n", findings.len());
    for finding in findings {
        let _ = writeln!(
            out,
            "  {}  {}  ({})",
            display_date(finding.date),
            finding.token,
            finding.reason
        );
    }
    out
}
