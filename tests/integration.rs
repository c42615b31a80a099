use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;
use std::time::Duration;
use std::env;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use reqwest::Method;
use serde_json::{Value, json};
use tempfile::TempDir;

use cockpit_tasks::auth::{AccessToken, StaticTokenProvider, TokenProvider};
use cockpit_tasks::error::StoreError;
use cockpit_tasks::graph::{ApiRequest, GraphClient, ListEndpoints, Transport};
use cockpit_tasks::mapping::{DropReason, DroppedField};
use cockpit_tasks::schema::LogicalField;
use cockpit_tasks::settings::Settings;
use cockpit_tasks::store::TaskStore;
use cockpit_tasks::types::{NewTask, Pole, Priority, Status};

static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

type Scripted = Result<Option<Value>, StoreError>;

/// In-memory transport: replays scripted responses and records requests.
#[derive(Default)]
struct FakeTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    fn new(responses: Vec<Scripted>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::default(),
        }
    }

    fn push(&self, response: Scripted) {
        self.responses
            .lock()
            .expect("responses lock should not be poisoned")
            .push_back(response);
    }

    fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .clone()
    }
}

impl Transport for FakeTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Option<Value>, StoreError> {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .push(request.clone());
        self.responses
            .lock()
            .expect("responses lock should not be poisoned")
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

fn list() -> ListEndpoints {
    ListEndpoints::new("contoso.sharepoint.com,site,web", "tasks")
}

fn columns(pairs: &[(&str, &str)]) -> Scripted {
    let value: Vec<Value> = pairs
        .iter()
        .map(|(name, display)| json!({ "name": name, "displayName": display }))
        .collect();
    Ok(Some(json!({ "value": value })))
}

fn core_columns() -> Scripted {
    columns(&[
        ("Title", "Titre"),
        ("Pole", "Pôle"),
        ("Status", "Statut"),
        ("SortOrder", "Ordre"),
    ])
}

fn full_columns() -> Scripted {
    columns(&[
        ("Title", "Titre"),
        ("Pole", "Pôle"),
        ("Statut0", "Statut"),
        ("Priorite", "Priorité"),
        ("field_5", "Échéance"),
        ("Notes", "Commentaires"),
        ("SortOrder", "Ordre"),
        ("Lien", "Lien"),
    ])
}

fn items(rows: Value) -> Scripted {
    Ok(Some(json!({ "value": rows })))
}

fn unknown_field(field: &str) -> Scripted {
    Err(StoreError::Http {
        status: 400,
        body: format!(
            "{{\"error\":{{\"code\":\"invalidRequest\",\"message\":\"Field '{field}' is not recognized\"}}}}"
        ),
    })
}

fn body_fields(request: &ApiRequest) -> Value {
    request
        .body
        .as_ref()
        .and_then(|body| body.get("fields"))
        .cloned()
        .expect("request should carry a fields object")
}

#[tokio::test]
async fn load_normalizes_values_and_sorts_by_pole() {
    let transport = FakeTransport::new(vec![
        core_columns(),
        items(json!([
            { "id": "1", "fields": { "Title": "Site web", "Pole": "EVO", "Status": "Terminé", "SortOrder": 1 } },
            { "id": "2", "fields": { "Title": "Chaudière", "Pole": "bien chez soi", "Status": "à faire", "SortOrder": "2" } }
        ])),
    ]);
    let mut store = TaskStore::new(transport, list());

    let tasks = store.load_tasks().await.expect("load should succeed");

    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, "2");
    assert_eq!(tasks[0].pole, Pole::Bcs);
    assert_eq!(tasks[0].status, Status::Backlog);
    assert_eq!(tasks[0].sort_order, 2.0);
    assert_eq!(tasks[1].pole, Pole::Evo);
    assert_eq!(tasks[1].status, Status::Termine);

    let requests = store.transport().requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].path.ends_with("/columns?$select=name,displayName"));
    assert!(requests[1].path.ends_with("/items?$top=500&$expand=fields"));
}

#[tokio::test]
async fn create_without_due_column_sends_core_fields_only() {
    let transport = FakeTransport::new(vec![
        core_columns(),
        Ok(Some(json!({
            "id": "31",
            "fields": { "Title": "Finaliser le rapport", "Pole": "BCS", "Status": "Backlog", "SortOrder": 1700000000000_i64 }
        }))),
    ]);
    let mut store = TaskStore::new(transport, list());
    let mut task = NewTask::new("Finaliser le rapport", Pole::Bcs);
    task.sort_order = 1_700_000_000_000.0;

    let outcome = store.create_task(task).await.expect("create should succeed");

    let requests = store.transport().requests();
    assert_eq!(requests[1].method, Method::POST);
    assert_eq!(
        body_fields(&requests[1]),
        json!({
            "Title": "Finaliser le rapport",
            "Pole": "BCS",
            "Status": "Backlog",
            "SortOrder": 1700000000000_i64
        })
    );
    assert_eq!(outcome.value.id, "31");
    assert_eq!(
        outcome.dropped,
        vec![DroppedField::unresolved(LogicalField::Priority)]
    );
    assert_eq!(store.tasks().len(), 1);
}

#[tokio::test]
async fn create_with_optional_values_unresolved_reports_each_drop() {
    let transport = FakeTransport::new(vec![
        core_columns(),
        Ok(Some(json!({ "id": "32", "fields": { "Title": "Relancer" } }))),
    ]);
    let mut store = TaskStore::new(transport, list());
    let mut task = NewTask::new("Relancer", Pole::Perso);
    task.due_date = "2025-03-01".to_string();
    task.notes = "voir mail".to_string();
    task.link_url = "https://example.com".to_string();

    let outcome = store.create_task(task).await.expect("create should succeed");

    let dropped: Vec<&str> = outcome
        .dropped
        .iter()
        .map(|field| field.field.as_str())
        .collect();
    assert_eq!(dropped, ["DueDate", "Priority", "Notes", "LinkUrl"]);
    let fields = body_fields(&store.transport().requests()[1]);
    assert!(fields.get("DueDate").is_none());
    assert!(fields.get("LinkUrl").is_none());
}

#[tokio::test]
async fn create_with_resolved_columns_writes_internal_keys() {
    let transport = FakeTransport::new(vec![
        full_columns(),
        Ok(Some(json!({
            "id": "40",
            "fields": {
                "Title": "Comité",
                "Pole": "EVO",
                "Statut0": "EnCours",
                "Priorite": "P1",
                "field_5": "2025-04-02",
                "Lien": { "Url": "https://example.com/ordre-du-jour", "Description": "" }
            }
        }))),
    ]);
    let mut store = TaskStore::new(transport, list());
    let mut task = NewTask::new("Comité", Pole::Evo);
    task.status = Status::EnCours;
    task.priority = Priority::P1;
    task.due_date = "2025-04-02".to_string();
    task.link_url = "https://example.com/ordre-du-jour".to_string();

    let outcome = store.create_task(task).await.expect("create should succeed");

    assert!(outcome.dropped.is_empty());
    let fields = body_fields(&store.transport().requests()[1]);
    assert_eq!(fields["Statut0"], json!("EnCours"));
    assert_eq!(fields["field_5"], json!("2025-04-02"));
    assert_eq!(
        fields["Lien"],
        json!({ "Url": "https://example.com/ordre-du-jour", "Description": "" })
    );
    assert_eq!(outcome.value.status, Status::EnCours);
    assert_eq!(outcome.value.due_date, "2025-04-02");
    assert_eq!(outcome.value.link_url, "https://example.com/ordre-du-jour");
}

#[tokio::test]
async fn empty_title_is_rejected_before_any_request() {
    let mut store = TaskStore::new(FakeTransport::default(), list());

    let err = store
        .create_task(NewTask::new("   ", Pole::Bcs))
        .await
        .expect_err("empty title should fail");

    assert!(matches!(err, StoreError::EmptyTitle));
    assert!(store.transport().requests().is_empty());
}

#[tokio::test]
async fn rejected_field_is_stripped_and_create_retried_once() {
    let transport = FakeTransport::new(vec![
        full_columns(),
        unknown_field("field_5"),
        Ok(Some(json!({ "id": "50", "fields": { "Title": "Budget" } }))),
    ]);
    let mut store = TaskStore::new(transport, list());
    let mut task = NewTask::new("Budget", Pole::Bcs);
    task.due_date = "2025-01-31".to_string();

    let outcome = store.create_task(task).await.expect("retry should succeed");

    let requests = store.transport().requests();
    assert_eq!(requests.len(), 3);
    assert!(body_fields(&requests[1]).get("field_5").is_some());
    assert!(body_fields(&requests[2]).get("field_5").is_none());
    assert_eq!(outcome.dropped, vec![DroppedField::rejected("field_5")]);
    assert_eq!(outcome.dropped[0].reason, DropReason::RejectedByServer);
}

#[tokio::test]
async fn repeated_rejection_propagates_and_keeps_collection() {
    let transport = FakeTransport::new(vec![
        full_columns(),
        unknown_field("field_5"),
        unknown_field("field_5"),
    ]);
    let mut store = TaskStore::new(transport, list());
    let mut task = NewTask::new("Budget", Pole::Bcs);
    task.due_date = "2025-01-31".to_string();

    let err = store.create_task(task).await.expect_err("should propagate");

    assert_eq!(err.status(), Some(400));
    assert_eq!(store.transport().requests().len(), 3);
    assert!(store.tasks().is_empty());
}

#[tokio::test]
async fn failed_column_read_degrades_and_is_retried_next_time() {
    let transport = FakeTransport::new(vec![
        Err(StoreError::Http {
            status: 403,
            body: "accessDenied".to_string(),
        }),
        Ok(Some(json!({ "id": "60", "fields": { "Title": "Malgré tout" } }))),
    ]);
    let mut store = TaskStore::new(transport, list());
    let mut task = NewTask::new("Malgré tout", Pole::Perso);
    task.notes = "sans colonne".to_string();

    let outcome = store.create_task(task).await.expect("create should still work");

    assert!(store.schema().is_some_and(|schema| schema.is_degraded()));
    let fields = body_fields(&store.transport().requests()[1]);
    assert_eq!(fields["Title"], json!("Malgré tout"));
    assert_eq!(fields["Pole"], json!("PERSO"));
    assert!(fields.get("Notes").is_none());
    assert!(fields.get("SortOrder").is_none());
    assert_eq!(
        fields.as_object().map(|fields| fields.len()),
        Some(3),
        "only Title, Pole and Status are sent without a schema"
    );
    assert!(
        outcome
            .dropped
            .contains(&DroppedField::unresolved(LogicalField::Notes))
    );
    assert!(
        outcome
            .dropped
            .contains(&DroppedField::unresolved(LogicalField::SortOrder))
    );

    store.transport().push(core_columns());
    store.transport().push(items(json!([])));
    store.load_tasks().await.expect("load should succeed");

    let requests = store.transport().requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[2].path.contains("/columns"));
    assert!(store.schema().is_some_and(|schema| !schema.is_degraded()));
}

#[tokio::test]
async fn empty_discovered_schema_is_not_rediscovered() {
    let transport = FakeTransport::new(vec![columns(&[]), items(json!([])), items(json!([]))]);
    let mut store = TaskStore::new(transport, list());

    store.load_tasks().await.expect("first load");
    store.load_tasks().await.expect("second load");

    let column_reads = store
        .transport()
        .requests()
        .iter()
        .filter(|request| request.path.contains("/columns"))
        .count();
    assert_eq!(column_reads, 1);
}

#[tokio::test]
async fn reset_schema_forces_a_new_column_read() {
    let transport = FakeTransport::new(vec![core_columns(), full_columns()]);
    let mut store = TaskStore::new(transport, list());

    store.ensure_schema().await;
    store.reset_schema();
    let schema = store.ensure_schema().await;

    assert_eq!(
        schema.resolution().get(LogicalField::DueDate),
        Some("field_5")
    );
    assert_eq!(store.transport().requests().len(), 2);
}

#[tokio::test]
async fn update_remaps_fields_and_refreshes_loaded_task() {
    let transport = FakeTransport::new(vec![
        full_columns(),
        items(json!([
            { "id": "7", "fields": { "Title": "Dossier", "Pole": "BCS", "Statut0": "Backlog" } }
        ])),
        Ok(None),
    ]);
    let mut store = TaskStore::new(transport, list());
    store.load_tasks().await.expect("load should succeed");

    let update = BTreeMap::from([
        (LogicalField::Status, json!("EnCours")),
        (LogicalField::DueDate, json!("2025-02-14")),
        (LogicalField::LinkUrl, json!("https://example.com/dossier")),
    ]);
    let outcome = store
        .update_task_fields("7", update)
        .await
        .expect("update should succeed");

    assert!(outcome.dropped.is_empty());
    let request = &store.transport().requests()[2];
    assert_eq!(request.method, Method::PATCH);
    assert!(request.path.ends_with("/items/7/fields"));
    assert_eq!(
        request.body,
        Some(json!({
            "Statut0": "EnCours",
            "field_5": "2025-02-14",
            "Lien": { "Url": "https://example.com/dossier", "Description": "" }
        }))
    );

    let task = &store.tasks()[0];
    assert_eq!(task.status, Status::EnCours);
    assert_eq!(task.due_date, "2025-02-14");
    assert_eq!(task.link_url, "https://example.com/dossier");
}

#[tokio::test]
async fn update_drops_unresolved_values_with_warning() {
    let transport = FakeTransport::new(vec![
        core_columns(),
        items(json!([{ "id": "8", "fields": { "Title": "Impôts", "Pole": "PERSO" } }])),
        Ok(None),
    ]);
    let mut store = TaskStore::new(transport, list());
    store.load_tasks().await.expect("load should succeed");

    let update = BTreeMap::from([
        (LogicalField::Title, json!("Impôts 2025")),
        (LogicalField::Priority, json!("P1")),
        (LogicalField::Notes, json!("")),
        (LogicalField::DueDate, json!("2025-05-20")),
    ]);
    let outcome = store
        .update_task_fields("8", update)
        .await
        .expect("update should succeed");

    assert_eq!(
        store.transport().requests()[2].body,
        Some(json!({ "Title": "Impôts 2025" }))
    );
    assert_eq!(
        outcome.dropped,
        vec![
            DroppedField::unresolved(LogicalField::Priority),
            DroppedField::unresolved(LogicalField::DueDate),
        ]
    );
    let task = &store.tasks()[0];
    assert_eq!(task.title, "Impôts 2025");
    assert_eq!(task.priority, Priority::P2);
    assert_eq!(task.due_date, "");
}

#[tokio::test]
async fn update_with_nothing_writable_sends_no_request() {
    let mut store = TaskStore::new(FakeTransport::new(vec![core_columns()]), list());

    let update = BTreeMap::from([
        (LogicalField::Priority, json!("P1")),
        (LogicalField::DueDate, json!("2025-05-20")),
    ]);
    let outcome = store
        .update_task_fields("8", update)
        .await
        .expect("update should succeed without a request");

    assert_eq!(
        outcome.dropped,
        vec![
            DroppedField::unresolved(LogicalField::Priority),
            DroppedField::unresolved(LogicalField::DueDate),
        ]
    );
    let requests = store.transport().requests();
    assert_eq!(requests.len(), 1);
    assert!(requests.iter().all(|request| request.method != Method::PATCH));
}

#[tokio::test]
async fn update_rejected_field_is_not_applied_locally() {
    let transport = FakeTransport::new(vec![
        full_columns(),
        items(json!([{ "id": "9", "fields": { "Title": "Salon", "Pole": "EVO" } }])),
        unknown_field("Notes"),
        Ok(None),
    ]);
    let mut store = TaskStore::new(transport, list());
    store.load_tasks().await.expect("load should succeed");

    let update = BTreeMap::from([
        (LogicalField::Status, json!("EnAttente")),
        (LogicalField::Notes, json!("stand B12")),
    ]);
    let outcome = store
        .update_task_fields("9", update)
        .await
        .expect("retry should succeed");

    assert_eq!(outcome.dropped, vec![DroppedField::rejected("Notes")]);
    assert_eq!(
        store.transport().requests()[3].body,
        Some(json!({ "Statut0": "EnAttente" }))
    );
    let task = &store.tasks()[0];
    assert_eq!(task.status, Status::EnAttente);
    assert_eq!(task.notes, "");
}

#[tokio::test]
async fn delete_removes_task_only_after_success() {
    let transport = FakeTransport::new(vec![
        core_columns(),
        items(json!([
            { "id": "1", "fields": { "Title": "A", "Pole": "BCS" } },
            { "id": "2", "fields": { "Title": "B", "Pole": "BCS" } }
        ])),
        Err(StoreError::Http {
            status: 503,
            body: "busy".to_string(),
        }),
        Ok(None),
    ]);
    let mut store = TaskStore::new(transport, list());
    store.load_tasks().await.expect("load should succeed");

    store.delete_task("1").await.expect_err("first delete fails");
    assert_eq!(store.tasks().len(), 2);

    store.delete_task("1").await.expect("second delete succeeds");
    assert_eq!(store.tasks().len(), 1);
    assert_eq!(store.tasks()[0].id, "2");

    let request = &store.transport().requests()[3];
    assert_eq!(request.method, Method::DELETE);
    assert!(request.path.ends_with("/items/1"));
    assert!(request.body.is_none());
}

#[tokio::test]
async fn failed_reload_keeps_previous_tasks() {
    let transport = FakeTransport::new(vec![
        core_columns(),
        items(json!([{ "id": "1", "fields": { "Title": "A", "Pole": "EVO" } }])),
        Err(StoreError::Transport("connection reset".to_string())),
    ]);
    let mut store = TaskStore::new(transport, list());
    store.load_tasks().await.expect("first load");

    store.load_tasks().await.expect_err("second load fails");

    assert_eq!(store.tasks().len(), 1);
}

/// Minimal HTTP server answering with scripted raw responses and recording
/// each request as received.
struct MockGraphServer {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    requests: Arc<Mutex<Vec<String>>>,
    pub port: u16,
}

impl MockGraphServer {
    fn start(responses: Vec<String>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .context("failed to bind mock graph server on random available port")?;
        let port = listener
            .local_addr()
            .context("failed to get mock server port")?
            .port();
        listener
            .set_nonblocking(true)
            .context("failed to make mock graph server non-blocking")?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let request_log = Arc::clone(&requests);
        let mut responses = VecDeque::from(responses);

        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
                        let request = read_http_request(&mut stream);
                        request_log
                            .lock()
                            .expect("mock request log lock should not be poisoned")
                            .push(request);

                        let response = responses.pop_front().unwrap_or_else(|| {
                            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_string()
                        });
                        let _ = stream.write_all(response.as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(15));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            stop,
            handle: Some(handle),
            requests,
            port,
        })
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/v1.0", self.port)
    }

    fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("mock request log lock should not be poisoned")
            .clone()
    }
}

impl Drop for MockGraphServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_http_request(stream: &mut std::net::TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        buffer.extend_from_slice(&chunk[..read]);

        let text = String::from_utf8_lossy(&buffer);
        let Some(header_end) = text.find("\r\n\r\n") else {
            continue;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        if buffer.len() >= header_end + 4 + content_length {
            break;
        }
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn json_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn graph_client(server: &MockGraphServer) -> GraphClient<StaticTokenProvider> {
    GraphClient::new(
        server.base_url(),
        Duration::from_secs(5),
        StaticTokenProvider::new("test-token"),
    )
    .expect("client should build")
}

#[tokio::test]
async fn graph_client_sends_bearer_and_json_headers() -> Result<()> {
    let server = MockGraphServer::start(vec![json_response("201 Created", r#"{"id":"77"}"#)])?;
    let client = graph_client(&server);

    let request = ApiRequest::new(Method::POST, "/sites/s/lists/l/items")
        .with_body(json!({ "fields": { "Title": "Hello" } }));
    let response = client.send(&request).await?;

    assert_eq!(response, Some(json!({ "id": "77" })));
    let recorded = server.requests();
    let raw = recorded.first().context("request should be recorded")?;
    let lower = raw.to_ascii_lowercase();
    assert!(raw.starts_with("POST /v1.0/sites/s/lists/l/items HTTP/1.1"));
    assert!(lower.contains("authorization: bearer test-token"));
    assert!(lower.contains("accept: application/json"));
    assert!(lower.contains("content-type: application/json"));
    assert!(raw.ends_with(r#"{"fields":{"Title":"Hello"}}"#));
    Ok(())
}

#[tokio::test]
async fn graph_client_treats_no_content_as_empty_success() -> Result<()> {
    let server = MockGraphServer::start(vec![
        "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_string(),
    ])?;
    let client = graph_client(&server);

    let response = client
        .send(&ApiRequest::new(Method::DELETE, "/sites/s/lists/l/items/3"))
        .await?;

    assert_eq!(response, None);
    let recorded = server.requests();
    let raw = recorded.first().context("request should be recorded")?;
    assert!(!raw.to_ascii_lowercase().contains("content-type:"));
    Ok(())
}

#[tokio::test]
async fn graph_client_surfaces_status_and_body() -> Result<()> {
    let body = r#"{"error":{"code":"invalidRequest","message":"Field 'DueDate' is not recognized"}}"#;
    let server = MockGraphServer::start(vec![json_response("400 Bad Request", body)])?;
    let client = graph_client(&server);

    let err = client
        .send(&ApiRequest::new(Method::PATCH, "/sites/s/lists/l/items/3/fields")
            .with_body(json!({ "DueDate": "2025-01-01" })))
        .await
        .expect_err("400 should fail");

    match err {
        StoreError::Http { status, body: text } => {
            assert_eq!(status, 400);
            assert_eq!(text, body);
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

/// Issues `token-1`, `token-2`, ... each valid for an hour.
struct SequenceTokenProvider {
    issued: Arc<AtomicUsize>,
}

impl TokenProvider for SequenceTokenProvider {
    async fn acquire(&self) -> Result<AccessToken, StoreError> {
        let call = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AccessToken {
            secret: format!("token-{call}"),
            expires_at: Utc::now() + TimeDelta::hours(1),
        })
    }
}

#[tokio::test]
async fn graph_client_reacquires_token_after_unauthorized() -> Result<()> {
    let server = MockGraphServer::start(vec![
        json_response("401 Unauthorized", r#"{"error":{"code":"InvalidAuthenticationToken"}}"#),
        json_response("200 OK", r#"{"value":[]}"#),
        json_response("200 OK", r#"{"value":[]}"#),
    ])?;
    let issued = Arc::new(AtomicUsize::new(0));
    let client = GraphClient::new(
        server.base_url(),
        Duration::from_secs(5),
        SequenceTokenProvider {
            issued: Arc::clone(&issued),
        },
    )?;
    let request = ApiRequest::new(Method::GET, "/sites/s/lists/l/columns");

    let err = client.send(&request).await.expect_err("401 should fail");
    assert_eq!(err.status(), Some(401));
    client.send(&request).await?;
    client.send(&request).await?;

    assert_eq!(issued.load(Ordering::SeqCst), 2);
    let recorded = server.requests();
    assert_eq!(recorded.len(), 3);
    assert!(recorded[0].to_ascii_lowercase().contains("bearer token-1"));
    assert!(recorded[1].to_ascii_lowercase().contains("bearer token-2"));
    assert!(recorded[2].to_ascii_lowercase().contains("bearer token-2"));
    Ok(())
}

#[tokio::test]
async fn store_over_http_loads_and_maps_tasks() -> Result<()> {
    let server = MockGraphServer::start(vec![
        json_response(
            "200 OK",
            r#"{"value":[{"name":"Title","displayName":"Titre"},{"name":"Pole","displayName":"Pôle"},{"name":"field_2","displayName":"Échéance"}]}"#,
        ),
        json_response(
            "200 OK",
            r#"{"value":[{"id":"4","fields":{"Title":"Chantier","Pole":"Bien chez soi","field_2":"2025-06-01"}}]}"#,
        ),
    ])?;
    let mut store = TaskStore::new(graph_client(&server), list()).with_page_size(50);

    let tasks = store.load_tasks().await?;

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].pole, Pole::Bcs);
    assert_eq!(tasks[0].due_date, "2025-06-01");
    let recorded = server.requests();
    assert_eq!(recorded.len(), 2);
    assert!(recorded[1].contains("/items?$top=50&$expand=fields"));
    Ok(())
}

struct EnvVarGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: impl AsRef<str>) -> Self {
        let previous = env::var(key).ok();
        unsafe {
            env::set_var(key, value.as_ref());
        }
        Self { key, previous }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        if let Some(previous) = &self.previous {
            unsafe {
                env::set_var(self.key, previous);
            }
        } else {
            unsafe {
                env::remove_var(self.key);
            }
        }
    }
}

#[test]
fn environment_token_overrides_settings_file() -> Result<()> {
    let _lock = ENV_LOCK
        .lock()
        .expect("env lock should not be poisoned");
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("settings.toml");
    std::fs::write(
        &path,
        "tenant_id = \"contoso.onmicrosoft.com\"\nclient_id = \"app\"\nsite_id = \"site\"\nlist_id = \"list\"\n\n[auth]\naccess_token = \"from-file\"\n",
    )?;

    let settings = Settings::load_from_path(&path);
    assert!(settings.missing_required().is_empty());

    {
        let _token = EnvVarGuard::set("COCKPIT_ACCESS_TOKEN", "from-env");
        assert_eq!(settings.access_token().as_deref(), Some("from-env"));
    }
    let _token = EnvVarGuard::set("COCKPIT_ACCESS_TOKEN", "");
    assert_eq!(settings.access_token().as_deref(), Some("from-file"));
    Ok(())
}
