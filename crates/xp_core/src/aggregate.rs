use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::catalog::{ResolveError, Task, TaskCatalog};
use crate::completion::CompletionSource;
use crate::token::{TokenDecodeError, TokenScheme};

/// Why a stored token contributes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unresolved {
    #[error(transparent)]
    Decode(#[from] TokenDecodeError),
    #[error(transparent)]
    Missing(#[from] ResolveError),
    #[error("token is for {embedded} but stored under {stored}")]
    WrongDate {
        embedded: NaiveDate,
        stored: NaiveDate,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    /// Raw number of stored tokens, resolvable or not.
    pub count: usize,
    pub xp: u64,
    pub unresolved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedToken {
    pub date: NaiveDate,
    pub token: String,
    pub reason: String,
}

/// Sums XP for completion sets against the current catalog.
///
/// Tokens that no longer decode or resolve count toward `count` but add no XP.
pub struct XpAggregator<'a> {
    catalog: &'a TaskCatalog,
    completions: &'a dyn CompletionSource,
    scheme: TokenScheme,
}

impl<'a> XpAggregator<'a> {
    pub fn new(
        catalog: &'a TaskCatalog,
        completions: &'a dyn CompletionSource,
        scheme: TokenScheme,
    ) -> Self {
        Self {
            catalog,
            completions,
            scheme,
        }
    }

    pub fn resolve(&self, date: NaiveDate, raw: &str) -> Result<&'a Task, Unresolved> {
        let token = self.scheme.decode(raw)?;
        if let Some(embedded) = token.date {
            if embedded != date {
                return Err(Unresolved::WrongDate {
                    embedded,
                    stored: date,
                });
            }
        }
        Ok(self.catalog.lookup(&token.task)?)
    }

    pub fn xp_for(&self, date: NaiveDate) -> u64 {
        self.summary(date).xp
    }

    pub fn count_for(&self, date: NaiveDate) -> usize {
        self.completions.get_completed(date).len()
    }

    pub fn summary(&self, date: NaiveDate) -> DaySummary {
        let tokens = self.completions.get_completed(date);
        let mut xp = 0u64;
        let mut unresolved = 0usize;
        for raw in tokens {
            match self.resolve(date, raw) {
                Ok(task) => xp += u64::from(task.xp),
                Err(_) => unresolved += 1,
            }
        }
        if unresolved > 0 {
            tracing::debug!(%date, unresolved, "tokens without a matching task");
        }
        DaySummary {
            date,
            count: tokens.len(),
            xp,
            unresolved,
        }
    }

    /// Every stored token that does not resolve, oldest date first.
    pub fn audit(&self) -> Vec<UnresolvedToken> {
        let mut findings = Vec::new();
        for date in self.completions.dates() {
            for raw in self.completions.get_completed(date) {
                if let Err(reason) = self.resolve(date, raw) {
                    findings.push(UnresolvedToken {
                        date,
                        token: raw.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
        }
        if !findings.is_empty() {
            tracing::warn!(count = findings.len(), "completion log holds unresolved tokens");
        }
        findings
    }
}
