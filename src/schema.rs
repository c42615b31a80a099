//! Column discovery for the target list and resolution of logical fields
//! to whatever internal column names the list actually uses.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::graph::{ApiRequest, ListEndpoints, Transport};
use crate::normalize::norm_key;

/// Application-level fields, independent of remote column names.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LogicalField {
    Title,
    Pole,
    Status,
    Priority,
    Notes,
    SortOrder,
    DueDate,
    LinkUrl,
}

impl LogicalField {
    /// Fields whose column is looked up at discovery time. Title is fixed.
    pub const RESOLVED: [LogicalField; 7] = [
        LogicalField::DueDate,
        LogicalField::Pole,
        LogicalField::Status,
        LogicalField::Priority,
        LogicalField::Notes,
        LogicalField::SortOrder,
        LogicalField::LinkUrl,
    ];

    pub fn canonical_key(self) -> &'static str {
        match self {
            LogicalField::Title => "Title",
            LogicalField::Pole => "Pole",
            LogicalField::Status => "Status",
            LogicalField::Priority => "Priority",
            LogicalField::Notes => "Notes",
            LogicalField::SortOrder => "SortOrder",
            LogicalField::DueDate => "DueDate",
            LogicalField::LinkUrl => "LinkUrl",
        }
    }

    /// Known column names for the field, English and French, in lookup order.
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            LogicalField::Title => &["Title", "Titre"],
            LogicalField::DueDate => &[
                "Echeance",
                "Échéance",
                "Date d'échéance",
                "Date echeance",
                "Due date",
                "DueDate",
                "Deadline",
            ],
            LogicalField::Pole => &["Pole", "Pôle", "Pôle (clé)", "PoleKey", "Module", "Domaine"],
            LogicalField::Status => &["Status", "Statut", "État", "Etat", "State"],
            LogicalField::Priority => &["Priority", "Priorité", "Priorite", "Urgence", "Importance"],
            LogicalField::Notes => &[
                "Notes",
                "Note",
                "Commentaires",
                "Commentaire",
                "Description",
                "Détails",
                "Details",
            ],
            LogicalField::SortOrder => &["SortOrder", "Order", "Ordre", "Position", "Tri"],
            LogicalField::LinkUrl => &[
                "LinkUrl",
                "Link URL",
                "Lien",
                "URL",
                "Url",
                "Hyperlink",
                "Lien URL",
            ],
        }
    }

    /// Parses a logical name as typed by a user (`due date`, `Échéance`...).
    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = norm_key(raw);
        let compact = wanted.replace([' ', '_', '-'], "");
        [LogicalField::Title]
            .into_iter()
            .chain(Self::RESOLVED)
            .find(|field| {
                norm_key(field.canonical_key()) == compact
                    || field
                        .candidates()
                        .iter()
                        .any(|candidate| norm_key(candidate) == wanted)
            })
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_key())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ColumnsResponse {
    #[serde(default)]
    value: Vec<ColumnDef>,
}

/// Logical field to internal column key, for the fields that resolved.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FieldResolution {
    keys: BTreeMap<LogicalField, String>,
}

impl FieldResolution {
    pub fn get(&self, field: LogicalField) -> Option<&str> {
        if field == LogicalField::Title {
            return Some(LogicalField::Title.canonical_key());
        }
        self.keys.get(&field).map(String::as_str)
    }

    pub fn insert(&mut self, field: LogicalField, key: impl Into<String>) {
        self.keys.insert(field, key.into());
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SchemaOrigin {
    Discovered,
    /// Column metadata could not be read; nothing is known about the list.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct Schema {
    columns: BTreeMap<String, String>,
    lookup: HashMap<String, String>,
    resolution: FieldResolution,
    origin: SchemaOrigin,
}

impl Schema {
    pub fn from_columns(columns: impl IntoIterator<Item = ColumnDef>) -> Self {
        let mut display_by_name = BTreeMap::new();
        let mut lookup = HashMap::new();

        for column in columns {
            let Some(name) = column.name.filter(|name| !name.is_empty()) else {
                continue;
            };
            let display = column
                .display_name
                .filter(|display| !display.is_empty());

            lookup.insert(norm_key(&name), name.clone());
            if let Some(display) = display.as_deref() {
                lookup.insert(norm_key(display), name.clone());
            }
            display_by_name.insert(name.clone(), display.unwrap_or(name));
        }

        let mut schema = Self {
            columns: display_by_name,
            lookup,
            resolution: FieldResolution::default(),
            origin: SchemaOrigin::Discovered,
        };
        for field in LogicalField::RESOLVED {
            if let Some(key) = schema.resolve_internal_name(field.candidates()) {
                schema.resolution.insert(field, key);
            }
        }
        schema
    }

    pub fn degraded() -> Self {
        Self {
            columns: BTreeMap::new(),
            lookup: HashMap::new(),
            resolution: FieldResolution::default(),
            origin: SchemaOrigin::Degraded,
        }
    }

    pub fn origin(&self) -> SchemaOrigin {
        self.origin
    }

    pub fn is_degraded(&self) -> bool {
        self.origin == SchemaOrigin::Degraded
    }

    /// First candidate whose normalized form names a known column.
    pub fn resolve_internal_name(&self, candidates: &[&str]) -> Option<String> {
        candidates
            .iter()
            .find_map(|candidate| self.lookup.get(&norm_key(candidate)).cloned())
    }

    pub fn resolution(&self) -> &FieldResolution {
        &self.resolution
    }

    /// Internal name to display name. `None` while degraded, where the
    /// real column set is unknown.
    pub fn known_columns(&self) -> Option<&BTreeMap<String, String>> {
        match self.origin {
            SchemaOrigin::Discovered => Some(&self.columns),
            SchemaOrigin::Degraded => None,
        }
    }
}

/// Reads the list's column metadata. A failed read degrades to an empty
/// schema instead of failing the caller.
pub async fn discover_schema<T: Transport>(transport: &T, list: &ListEndpoints) -> Schema {
    let request = ApiRequest::new(Method::GET, list.columns());
    let response = match transport.send(&request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "failed to load list columns; optional fields disabled");
            return Schema::degraded();
        }
    };

    let columns = match response.map(serde_json::from_value::<ColumnsResponse>) {
        Some(Ok(parsed)) => parsed.value,
        Some(Err(err)) => {
            warn!(error = %err, "unreadable list columns payload; optional fields disabled");
            return Schema::degraded();
        }
        None => Vec::new(),
    };

    let schema = Schema::from_columns(columns);
    debug!(
        columns = schema.columns.len(),
        resolved = ?schema.resolution.keys,
        "list schema discovered"
    );
    schema
}
