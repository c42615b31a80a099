use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::normalize::{normalize_pole, normalize_priority, normalize_status};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Pole {
    Bcs,
    Evo,
    Perso,
    Unassigned,
    Other(String),
}

impl Pole {
    pub fn as_str(&self) -> &str {
        match self {
            Pole::Bcs => "BCS",
            Pole::Evo => "EVO",
            Pole::Perso => "PERSO",
            Pole::Unassigned => "",
            Pole::Other(raw) => raw,
        }
    }

    pub fn is_assigned(&self) -> bool {
        !self.as_str().is_empty()
    }
}

impl From<String> for Pole {
    fn from(raw: String) -> Self {
        normalize_pole(&raw)
    }
}

impl From<Pole> for String {
    fn from(pole: Pole) -> Self {
        pole.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Status {
    Backlog,
    EnCours,
    EnAttente,
    Termine,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Backlog => "Backlog",
            Status::EnCours => "EnCours",
            Status::EnAttente => "EnAttente",
            Status::Termine => "Termine",
            Status::Other(raw) => raw,
        }
    }

    pub fn is_open(&self) -> bool {
        *self != Status::Termine
    }
}

impl From<String> for Status {
    fn from(raw: String) -> Self {
        normalize_status(&raw)
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Priority {
    P1,
    P2,
    P3,
    Other(String),
}

impl Priority {
    pub fn as_str(&self) -> &str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::Other(raw) => raw,
        }
    }
}

impl From<String> for Priority {
    fn from(raw: String) -> Self {
        normalize_priority(&raw)
    }
}

impl From<Priority> for String {
    fn from(priority: Priority) -> Self {
        priority.as_str().to_string()
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(Pole, Status, Priority);

/// A task as read back from the list. `id` is assigned by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub pole: Pole,
    pub status: Status,
    pub priority: Priority,
    #[serde(default)]
    pub due_date: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub link_url: String,
    pub sort_order: f64,
}

/// User input for a task that does not exist remotely yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub pole: Pole,
    pub status: Status,
    pub priority: Priority,
    pub due_date: String,
    pub notes: String,
    pub link_url: String,
    pub sort_order: f64,
}

impl NewTask {
    /// Starts a backlog task in `pole`, ordered by its creation time.
    pub fn new(title: impl Into<String>, pole: Pole) -> Self {
        Self {
            title: title.into(),
            pole,
            status: Status::Backlog,
            priority: Priority::P2,
            due_date: String::new(),
            notes: String::new(),
            link_url: String::new(),
            sort_order: Utc::now().timestamp_millis() as f64,
        }
    }
}
