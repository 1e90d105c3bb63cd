use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::TaskRef;

pub const SEPARATOR: char = '_';

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenScheme {
    /// `category[_day]_index_date`
    #[default]
    DateScoped,
    /// `category[_day]_index`, the date comes from the log key.
    DateIndependent,
}

impl TokenScheme {
    pub fn embeds_date(self) -> bool {
        matches!(self, Self::DateScoped)
    }

    pub fn encode(self, task: &TaskRef, date: NaiveDate) -> String {
        encode(task, self.embeds_date().then_some(date))
    }

    pub fn decode(self, raw: &str) -> Result<CompletionToken, TokenDecodeError> {
        decode(raw, self)
    }
}

impl fmt::Display for TokenScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DateScoped => f.write_str("date-scoped"),
            Self::DateIndependent => f.write_str("date-independent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown token scheme `{0}` (expected `date-scoped` or `date-independent`)")]
pub struct ParseSchemeError(String);

impl FromStr for TokenScheme {
    type Err = ParseSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "date-scoped" | "scoped" | "dated" => Ok(Self::DateScoped),
            "date-independent" | "independent" | "plain" => Ok(Self::DateIndependent),
            _ => Err(ParseSchemeError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenDecodeError {
    #[error("token is empty")]
    Empty,
    #[error("token `{token}` has {found} segments")]
    Arity { token: String, found: usize },
    #[error("token `{0}` has an empty segment")]
    EmptySegment(String),
    #[error("`{0}` is not a task index")]
    BadIndex(String),
    #[error("`{0}` is not an ISO date")]
    BadDate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompletionToken {
    pub task: TaskRef,
    pub date: Option<NaiveDate>,
}

pub fn encode(task: &TaskRef, date: Option<NaiveDate>) -> String {
    let mut token = task.category.clone();
    if let Some(day) = &task.day {
        token.push(SEPARATOR);
        token.push_str(day);
    }
    token.push(SEPARATOR);
    token.push_str(&task.index.to_string());
    if let Some(date) = date {
        token.push(SEPARATOR);
        token.push_str(&date.format(DATE_FORMAT).to_string());
    }
    token
}

/// Two segments are a flat reference and three a weekly one, after any date segment.
pub fn decode(raw: &str, scheme: TokenScheme) -> Result<CompletionToken, TokenDecodeError> {
    if raw.is_empty() {
        return Err(TokenDecodeError::Empty);
    }

    let mut segments: Vec<&str> = raw.split(SEPARATOR).collect();
    let date = if scheme.embeds_date() {
        let last = match segments.pop() {
            Some(last) if segments.len() >= 2 => last,
            _ => {
                return Err(TokenDecodeError::Arity {
                    token: raw.to_string(),
                    found: raw.split(SEPARATOR).count(),
                })
            }
        };
        let date = NaiveDate::parse_from_str(last, DATE_FORMAT)
            .map_err(|_| TokenDecodeError::BadDate(last.to_string()))?;
        Some(date)
    } else {
        None
    };

    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TokenDecodeError::EmptySegment(raw.to_string()));
    }

    let task = match segments.as_slice() {
        [category, day, index] => TaskRef::weekly(*category, *day, parse_index(index)?),
        [category, index] => TaskRef::flat(*category, parse_index(index)?),
        _ => {
            return Err(TokenDecodeError::Arity {
                token: raw.to_string(),
                found: raw.split(SEPARATOR).count(),
            })
        }
    };

    Ok(CompletionToken { task, date })
}

fn parse_index(segment: &str) -> Result<usize, TokenDecodeError> {
    if !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TokenDecodeError::BadIndex(segment.to_string()));
    }
    segment
        .parse()
        .map_err(|_| TokenDecodeError::BadIndex(segment.to_string()))
}
