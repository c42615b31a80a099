//! Conversion between [`Task`] and the raw field map stored in a list item.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use crate::normalize::{norm_key, normalize_pole, normalize_priority, normalize_status};
use crate::schema::{FieldResolution, LogicalField};
use crate::types::{NewTask, Task};

pub type RawFields = Map<String, Value>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The list has no column for the field.
    ColumnUnresolved,
    /// The server refused the field and the write was retried without it.
    RejectedByServer,
}

/// A value that was not written. Writes still succeed without it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DroppedField {
    pub field: String,
    pub reason: DropReason,
}

impl DroppedField {
    pub fn unresolved(field: LogicalField) -> Self {
        Self {
            field: field.canonical_key().to_string(),
            reason: DropReason::ColumnUnresolved,
        }
    }

    pub fn rejected(key: impl Into<String>) -> Self {
        Self {
            field: key.into(),
            reason: DropReason::RejectedByServer,
        }
    }
}

impl fmt::Display for DroppedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            DropReason::ColumnUnresolved => {
                write!(f, "list has no {} column; value ignored", self.field)
            }
            DropReason::RejectedByServer => {
                write!(f, "server rejected field {}; value ignored", self.field)
            }
        }
    }
}

/// A list item as returned with `$expand=fields`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub fields: RawFields,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "item id must be a string or number, got {other}"
        ))),
    }
}

/// Fields ready to send plus whatever had to be left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outbound {
    pub fields: RawFields,
    pub dropped: Vec<DroppedField>,
}

fn inbound_keys(field: LogicalField) -> &'static [&'static str] {
    match field {
        LogicalField::Title => &["Title", "Titre"],
        LogicalField::Pole => &["Pole", "Pôle", "PoleKey", "PoleId"],
        LogicalField::Status => &["Status", "Statut"],
        LogicalField::DueDate => &["DueDate", "Echeance", "Échéance", "Echéance", "Due", "Date"],
        LogicalField::Priority => &["Priority", "Priorite", "Priorité"],
        LogicalField::Notes => &["Notes", "Note", "Commentaires", "Commentaire"],
        LogicalField::SortOrder => &["SortOrder", "Order", "Ordre"],
        LogicalField::LinkUrl => &["LinkUrl", "Lien", "URL", "Url"],
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

/// First non-empty value under one of `keys`: exact keys in order, then any
/// present key that normalizes to one of them.
pub fn pick_field<'a>(fields: &'a RawFields, keys: &[&str]) -> Option<&'a Value> {
    if let Some(value) = keys
        .iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| is_present(value))
    {
        return Some(value);
    }

    let wanted: Vec<String> = keys.iter().map(|key| norm_key(key)).collect();
    fields
        .iter()
        .filter(|(key, _)| wanted.contains(&norm_key(key)))
        .map(|(_, value)| value)
        .find(|value| is_present(value))
}

fn lookup<'a>(
    fields: &'a RawFields,
    field: LogicalField,
    resolution: &FieldResolution,
) -> Option<&'a Value> {
    let mut keys: Vec<&str> = Vec::with_capacity(8);
    if let Some(resolved) = resolution.get(field) {
        keys.push(resolved);
    }
    keys.extend(inbound_keys(field));
    pick_field(fields, &keys)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Object(object) => object
            .get("Url")
            .or_else(|| object.get("url"))
            .map(value_text)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn value_number(value: &Value) -> f64 {
    match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => text.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn remote_row_to_task(item: &RemoteItem, resolution: &FieldResolution) -> Task {
    let fields = &item.fields;
    let text = |field| {
        lookup(fields, field, resolution)
            .map(value_text)
            .unwrap_or_default()
    };

    Task {
        id: item.id.clone(),
        title: text(LogicalField::Title),
        pole: normalize_pole(&text(LogicalField::Pole)),
        status: normalize_status(&text(LogicalField::Status)),
        priority: normalize_priority(&text(LogicalField::Priority)),
        due_date: text(LogicalField::DueDate),
        notes: text(LogicalField::Notes),
        link_url: text(LogicalField::LinkUrl),
        sort_order: lookup(fields, LogicalField::SortOrder, resolution)
            .map(value_number)
            .unwrap_or(0.0),
    }
}

pub fn sort_order_value(sort_order: f64) -> Value {
    if sort_order.is_finite() && sort_order.fract() == 0.0 && sort_order.abs() < 9.0e15 {
        json!(sort_order as i64)
    } else {
        json!(sort_order)
    }
}

pub fn link_value(url: &str) -> Value {
    json!({ "Url": url, "Description": "" })
}

/// Builds the create payload. Optional fields without a resolved column are
/// omitted and reported.
pub fn task_to_remote_fields(task: &NewTask, resolution: &FieldResolution) -> Outbound {
    let mut outbound = Outbound::default();
    let fields = &mut outbound.fields;

    fields.insert(
        LogicalField::Title.canonical_key().to_string(),
        json!(task.title),
    );
    for (field, value) in [
        (LogicalField::Pole, task.pole.as_str()),
        (LogicalField::Status, task.status.as_str()),
    ] {
        let key = resolution.get(field).unwrap_or(field.canonical_key());
        fields.insert(key.to_string(), json!(value));
    }

    let optional = [
        (LogicalField::DueDate, json!(task.due_date), !task.due_date.is_empty()),
        (
            LogicalField::Priority,
            json!(task.priority.as_str()),
            !task.priority.as_str().is_empty(),
        ),
        (LogicalField::Notes, json!(task.notes), !task.notes.is_empty()),
        (
            LogicalField::LinkUrl,
            link_value(&task.link_url),
            !task.link_url.is_empty(),
        ),
        (
            LogicalField::SortOrder,
            sort_order_value(task.sort_order),
            task.sort_order.is_finite(),
        ),
    ];
    for (field, value, has_value) in optional {
        if !has_value {
            continue;
        }
        match resolution.get(field) {
            Some(key) => {
                fields.insert(key.to_string(), value);
            }
            None => outbound.dropped.push(DroppedField::unresolved(field)),
        }
    }

    outbound
}

/// Removes every link-like key: anything normalizing to `linkurl`, plus the
/// resolved link column.
pub fn strip_link_fields(fields: &mut RawFields, resolution: &FieldResolution) {
    let link_key = norm_key(LogicalField::LinkUrl.canonical_key());
    let resolved = resolution.get(LogicalField::LinkUrl);
    fields.retain(|key, _| norm_key(key) != link_key && Some(key.as_str()) != resolved);
}

/// Keeps only keys naming a known column, and drops null values.
pub fn prune_unknown_fields(mut fields: RawFields, columns: &BTreeMap<String, String>) -> RawFields {
    fields.retain(|key, value| !value.is_null() && columns.contains_key(key));
    fields
}

/// Rewrites a logical partial update onto the list's internal keys.
pub fn remap_partial_update(
    update: &BTreeMap<LogicalField, Value>,
    resolution: &FieldResolution,
) -> Outbound {
    let mut outbound = Outbound::default();

    for (field, value) in update {
        let has_value = is_present(value);
        match (resolution.get(*field), *field) {
            (Some(key), LogicalField::LinkUrl) => {
                if has_value {
                    outbound
                        .fields
                        .insert(key.to_string(), link_value(&value_text(value)));
                }
            }
            (Some(key), _) => {
                outbound.fields.insert(key.to_string(), value.clone());
            }
            (None, LogicalField::DueDate) => {
                outbound.dropped.push(DroppedField::unresolved(*field));
            }
            (None, _) if has_value => {
                outbound.dropped.push(DroppedField::unresolved(*field));
            }
            (None, _) => {}
        }
    }

    outbound
}

/// Applies logical values to a task, normalizing pole, status and priority
/// the same way reads do.
pub fn apply_update(task: &mut Task, field: LogicalField, value: &Value) {
    match field {
        LogicalField::Title => task.title = value_text(value),
        LogicalField::Pole => task.pole = normalize_pole(&value_text(value)),
        LogicalField::Status => task.status = normalize_status(&value_text(value)),
        LogicalField::Priority => task.priority = normalize_priority(&value_text(value)),
        LogicalField::Notes => task.notes = value_text(value),
        LogicalField::SortOrder => task.sort_order = value_number(value),
        LogicalField::DueDate => task.due_date = value_text(value),
        LogicalField::LinkUrl => task.link_url = value_text(value),
    }
}
