//! Session-scoped facade over one remote list: schema, transport and the
//! loaded task collection live together in [`TaskStore`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::graph::retry::{GraphUnknownFieldClassifier, UnknownFieldClassifier, send_with_field_fallback};
use crate::graph::{ApiRequest, ListEndpoints, Transport};
use crate::mapping::{
    DroppedField, RawFields, RemoteItem, apply_update, prune_unknown_fields, remap_partial_update,
    remote_row_to_task, strip_link_fields, task_to_remote_fields,
};
use crate::schema::{LogicalField, Schema, discover_schema};
use crate::types::{NewTask, Task};

pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Result of a write plus the values that could not be written.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome<V> {
    pub value: V,
    pub dropped: Vec<DroppedField>,
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    value: Vec<RemoteItem>,
}

pub struct TaskStore<T, C = GraphUnknownFieldClassifier> {
    transport: T,
    list: ListEndpoints,
    page_size: u32,
    classifier: C,
    schema: Option<Schema>,
    tasks: Vec<Task>,
}

impl<T: Transport + Sync> TaskStore<T> {
    pub fn new(transport: T, list: ListEndpoints) -> Self {
        Self::with_classifier(transport, list, GraphUnknownFieldClassifier)
    }
}

impl<T, C> TaskStore<T, C>
where
    T: Transport + Sync,
    C: UnknownFieldClassifier + Sync,
{
    pub fn with_classifier(transport: T, list: ListEndpoints, classifier: C) -> Self {
        Self {
            transport,
            list,
            page_size: DEFAULT_PAGE_SIZE,
            classifier,
            schema: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Forgets the discovered schema; the next operation discovers it again.
    pub fn reset_schema(&mut self) {
        self.schema = None;
    }

    /// Discovers the list schema unless a usable one is already known. A
    /// degraded schema from a failed read is retried.
    pub async fn ensure_schema(&mut self) -> &Schema {
        let usable = self
            .schema
            .as_ref()
            .is_some_and(|schema| !schema.is_degraded());
        if !usable {
            let schema = discover_schema(&self.transport, &self.list).await;
            self.schema = Some(schema);
        }
        self.schema.get_or_insert_with(Schema::degraded)
    }

    pub async fn load_tasks(&mut self) -> Result<&[Task], StoreError> {
        let resolution = self.ensure_schema().await.resolution().clone();

        let request = ApiRequest::new(Method::GET, self.list.items(self.page_size));
        let page: ItemsPage = match self.transport.send(&request).await? {
            Some(body) => serde_json::from_value(body)
                .map_err(|err| StoreError::InvalidResponse(format!("list items: {err}")))?,
            None => ItemsPage { value: Vec::new() },
        };

        let mut tasks: Vec<Task> = page
            .value
            .iter()
            .map(|item| remote_row_to_task(item, &resolution))
            .collect();
        tasks.sort_by(compare_for_listing);

        info!(count = tasks.len(), "tasks loaded");
        self.tasks = tasks;
        Ok(&self.tasks)
    }

    pub async fn create_task(&mut self, task: NewTask) -> Result<WriteOutcome<Task>, StoreError> {
        if task.title.trim().is_empty() {
            return Err(StoreError::EmptyTitle);
        }

        let schema = self.ensure_schema().await.clone();
        let resolution = schema.resolution();
        let mut outbound = task_to_remote_fields(&task, resolution);
        if task.link_url.is_empty() {
            strip_link_fields(&mut outbound.fields, resolution);
        }
        let fields = prune_for(&schema, outbound.fields);

        let request = ApiRequest::new(Method::POST, self.list.create_item())
            .with_body(json!({ "fields": fields }));
        let result = send_with_field_fallback(&self.transport, &self.classifier, request).await?;
        let mut dropped = outbound.dropped;
        dropped.extend(result.dropped.map(DroppedField::rejected));

        let body = result
            .response
            .ok_or_else(|| StoreError::InvalidResponse("create returned no item".to_string()))?;
        let item: RemoteItem = serde_json::from_value(body)
            .map_err(|err| StoreError::InvalidResponse(format!("created item: {err}")))?;
        let created = remote_row_to_task(&item, resolution);

        log_dropped(&created.id, &dropped);
        debug!(id = %created.id, "task created");
        self.tasks.push(created.clone());
        Ok(WriteOutcome {
            value: created,
            dropped,
        })
    }

    /// Writes a partial update given in logical field names. The loaded task
    /// with that id, if any, is updated with the values that were written.
    pub async fn update_task_fields(
        &mut self,
        id: &str,
        update: BTreeMap<LogicalField, Value>,
    ) -> Result<WriteOutcome<()>, StoreError> {
        let schema = self.ensure_schema().await.clone();
        let resolution = schema.resolution();
        let outbound = remap_partial_update(&update, resolution);
        let mut fields = prune_for(&schema, outbound.fields);
        if fields.is_empty() {
            log_dropped(id, &outbound.dropped);
            debug!(id, "nothing left to write; update skipped");
            return Ok(WriteOutcome {
                value: (),
                dropped: outbound.dropped,
            });
        }

        let request = ApiRequest::new(Method::PATCH, self.list.item_fields(id))
            .with_body(Value::Object(fields.clone()));
        let result = send_with_field_fallback(&self.transport, &self.classifier, request).await?;
        let mut dropped = outbound.dropped;
        if let Some(rejected) = result.dropped {
            fields.remove(&rejected);
            dropped.push(DroppedField::rejected(rejected));
        }

        if let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) {
            for (field, value) in &update {
                let written = resolution
                    .get(*field)
                    .is_some_and(|key| fields.contains_key(key));
                if written {
                    apply_update(task, *field, value);
                }
            }
        }

        log_dropped(id, &dropped);
        debug!(id, written = fields.len(), "task updated");
        Ok(WriteOutcome { value: (), dropped })
    }

    pub async fn delete_task(&mut self, id: &str) -> Result<(), StoreError> {
        let request = ApiRequest::new(Method::DELETE, self.list.item(id));
        self.transport.send(&request).await?;
        self.tasks.retain(|task| task.id != id);
        debug!(id, "task deleted");
        Ok(())
    }
}

fn prune_for(schema: &Schema, fields: RawFields) -> RawFields {
    match schema.known_columns() {
        Some(columns) => prune_unknown_fields(fields, columns),
        None => fields.into_iter().filter(|(_, value)| !value.is_null()).collect(),
    }
}

fn log_dropped(id: &str, dropped: &[DroppedField]) {
    for field in dropped {
        warn!(id, field = %field.field, reason = ?field.reason, "{field}");
    }
}

/// Listing order: pole, status, sort order, title.
pub fn compare_for_listing(a: &Task, b: &Task) -> Ordering {
    a.pole
        .as_str()
        .cmp(b.pole.as_str())
        .then_with(|| a.status.as_str().cmp(b.status.as_str()))
        .then_with(|| a.sort_order.total_cmp(&b.sort_order))
        .then_with(|| a.title.cmp(&b.title))
}
