use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::SEPARATOR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "task")]
    pub label: String,
    pub xp: u32,
}

/// Positional identity of a task inside the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    pub category: String,
    pub day: Option<String>,
    pub index: usize,
}

impl TaskRef {
    pub fn flat(category: impl Into<String>, index: usize) -> Self {
        Self {
            category: category.into(),
            day: None,
            index,
        }
    }

    pub fn weekly(category: impl Into<String>, day: impl Into<String>, index: usize) -> Self {
        Self {
            category: category.into(),
            day: Some(day.into()),
            index,
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.day {
            Some(day) => write!(f, "{} / {} #{}", self.category, day, self.index),
            None => write!(f, "{} #{}", self.category, self.index),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog is not valid: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("category names must not be empty")]
    EmptyCategory,
    #[error("category `{category}` contains an empty day label")]
    EmptyDay { category: String },
    #[error("{kind} `{name}` contains the reserved separator `{separator}`")]
    ReservedSeparator {
        kind: &'static str,
        name: String,
        separator: char,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    #[error("category `{category}` has no day `{day}`")]
    UnknownDay { category: String, day: String },
    #[error("category `{0}` is a weekly plan and needs a day")]
    DayRequired(String),
    #[error("category `{0}` has no days")]
    UnexpectedDay(String),
    #[error("task index {index} is out of range ({len} tasks)")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Reads a JSON object into an [`IndexMap`], keeping document order and
/// refusing repeated keys.
fn unique_entries<'de, A, V>(mut access: A) -> Result<IndexMap<String, V>, A::Error>
where
    A: MapAccess<'de>,
    V: Deserialize<'de>,
{
    let mut entries = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
    while let Some((key, value)) = access.next_entry::<String, V>()? {
        if entries.contains_key(&key) {
            return Err(de::Error::custom(format_args!("duplicate key `{key}`")));
        }
        entries.insert(key, value);
    }
    Ok(entries)
}

/// Tasks of one category: either a plain list or a weekly plan keyed by day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CategoryTasks {
    Flat(Vec<Task>),
    Weekly(IndexMap<String, Vec<Task>>),
}

impl<'de> Deserialize<'de> for CategoryTasks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ShapeVisitor;

        impl<'de> Visitor<'de> for ShapeVisitor {
            type Value = CategoryTasks;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a list of tasks or a map of day labels to lists of tasks")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut tasks = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(task) = seq.next_element::<Task>()? {
                    tasks.push(task);
                }
                Ok(CategoryTasks::Flat(tasks))
            }

            fn visit_map<A: MapAccess<'de>>(self, access: A) -> Result<Self::Value, A::Error> {
                unique_entries(access).map(CategoryTasks::Weekly)
            }
        }

        deserializer.deserialize_any(ShapeVisitor)
    }
}

/// One task in display order, paired with the reference that identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSlot<'a> {
    pub task_ref: TaskRef,
    pub task: &'a Task,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TaskCatalog {
    categories: IndexMap<String, CategoryTasks>,
}

impl<'de> Deserialize<'de> for TaskCatalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CatalogVisitor;

        impl<'de> Visitor<'de> for CatalogVisitor {
            type Value = TaskCatalog;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of category names to tasks")
            }

            fn visit_map<A: MapAccess<'de>>(self, access: A) -> Result<Self::Value, A::Error> {
                unique_entries(access).map(|categories| TaskCatalog { categories })
            }
        }

        deserializer.deserialize_map(CatalogVisitor)
    }
}

impl TaskCatalog {
    pub fn parse(text: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.keys().cloned().collect()
    }

    pub fn tasks(&self, category: &str) -> Option<&CategoryTasks> {
        self.categories.get(category)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &CategoryTasks)> {
        self.categories
            .iter()
            .map(|(category, tasks)| (category.as_str(), tasks))
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Swaps in a whole new catalog. Existing completion tokens are not checked.
    pub fn replace(&mut self, other: TaskCatalog) {
        *self = other;
    }

    /// Names must be non-empty and free of the token separator.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (category, tasks) in self.categories.iter() {
            check_name("category", category)?;
            if let CategoryTasks::Weekly(days) = tasks {
                for day in days.keys() {
                    if day.is_empty() {
                        return Err(CatalogError::EmptyDay {
                            category: category.to_string(),
                        });
                    }
                    check_name("day", day)?;
                }
            }
        }
        Ok(())
    }

    pub fn lookup(&self, task_ref: &TaskRef) -> Result<&Task, ResolveError> {
        let tasks = self
            .categories
            .get(&task_ref.category)
            .ok_or_else(|| ResolveError::UnknownCategory(task_ref.category.clone()))?;

        let list = match (tasks, &task_ref.day) {
            (CategoryTasks::Flat(list), None) => list,
            (CategoryTasks::Flat(_), Some(_)) => {
                return Err(ResolveError::UnexpectedDay(task_ref.category.clone()))
            }
            (CategoryTasks::Weekly(_), None) => {
                return Err(ResolveError::DayRequired(task_ref.category.clone()))
            }
            (CategoryTasks::Weekly(days), Some(day)) => {
                days.get(day).ok_or_else(|| ResolveError::UnknownDay {
                    category: task_ref.category.clone(),
                    day: day.clone(),
                })?
            }
        };

        list.get(task_ref.index)
            .ok_or(ResolveError::IndexOutOfRange {
                index: task_ref.index,
                len: list.len(),
            })
    }

    pub fn slots(&self) -> Vec<TaskSlot<'_>> {
        let mut slots = Vec::new();
        for (category, tasks) in self.categories.iter() {
            match tasks {
                CategoryTasks::Flat(list) => {
                    slots.extend(list.iter().enumerate().map(|(index, task)| TaskSlot {
                        task_ref: TaskRef::flat(category, index),
                        task,
                    }));
                }
                CategoryTasks::Weekly(days) => {
                    for (day, list) in days.iter() {
                        slots.extend(list.iter().enumerate().map(|(index, task)| TaskSlot {
                            task_ref: TaskRef::weekly(category, day, index),
                            task,
                        }));
                    }
                }
            }
        }
        slots
    }

    pub fn task_count(&self) -> usize {
        self.slots().len()
    }

    pub fn total_xp(&self) -> u64 {
        self.slots().iter().map(|slot| u64::from(slot.task.xp)).sum()
    }
}

fn check_name(kind: &'static str, name: &str) -> Result<(), CatalogError> {
    if name.is_empty() {
        return Err(CatalogError::EmptyCategory);
    }
    if name.contains(SEPARATOR) {
        return Err(CatalogError::ReservedSeparator {
            kind,
            name: name.to_string(),
            separator: SEPARATOR,
        });
    }
    Ok(())
}
