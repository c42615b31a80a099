use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Subcommand};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::{
    auth::{Credentials, RefreshTokenProvider, StaticTokenProvider},
    dashboard::{DEFAULT_TOP_TASKS, SyncOutcome, classify_sync, pole_kpis, top_tasks},
    error::StoreError,
    graph::{GraphClient, ListEndpoints, Transport},
    mapping::DroppedField,
    normalize::{normalize_pole, normalize_priority, normalize_status},
    schema::LogicalField,
    settings::{ACCESS_TOKEN_ENV, REFRESH_TOKEN_ENV, Settings},
    store::TaskStore,
    types::{NewTask, Task},
};

const SCHEMA_VERSION: &str = "cli.v1";

#[derive(Debug, Clone, Subcommand)]
pub enum RootCommand {
    /// List tasks, optionally filtered by pole and status.
    List(ListArgs),
    Create(CreateArgs),
    /// Write logical fields of one task.
    Update(UpdateArgs),
    Delete(DeleteArgs),
    /// Per-pole counters and the next tasks to handle.
    Summary,
    /// Show how logical fields map onto the list's columns.
    Schema,
    /// Write a settings file with placeholders for the required keys.
    Init(InitArgs),
}

#[derive(Debug, Clone, Args)]
pub struct InitArgs {
    /// Replace an existing settings file.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ListArgs {
    #[arg(long, value_name = "POLE")]
    pub pole: Option<String>,

    #[arg(long, value_name = "STATUS")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    #[arg(long, value_name = "TEXT")]
    pub title: String,

    #[arg(long, value_name = "POLE")]
    pub pole: Option<String>,

    #[arg(long, value_name = "STATUS")]
    pub status: Option<String>,

    #[arg(long, value_name = "PRIORITY")]
    pub priority: Option<String>,

    #[arg(long, value_name = "DATE")]
    pub due: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub notes: Option<String>,

    #[arg(long, value_name = "URL")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct UpdateArgs {
    #[arg(long, value_name = "TASK_ID")]
    pub id: String,

    /// `Field=value`, with a logical field name such as `Status` or `DueDate`.
    #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
    pub assignments: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct DeleteArgs {
    #[arg(long, value_name = "TASK_ID")]
    pub id: String,
}

pub async fn run(
    settings: &Settings,
    config_path: Option<&Path>,
    command: RootCommand,
    json_output: bool,
    quiet: bool,
) -> i32 {
    let result = match command {
        RootCommand::Init(args) => init_settings(config_path, args),
        command => execute(settings, command).await,
    };
    match result {
        Ok(output) => {
            print_success(output, json_output, quiet);
            0
        }
        Err(err) => {
            print_error(&err, json_output);
            err.exit_code
        }
    }
}

struct CommandOutput {
    command: &'static str,
    data: Value,
    text: String,
}

#[derive(Debug)]
struct CliError {
    exit_code: i32,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

type CliResult<T> = Result<T, CliError>;

async fn execute(settings: &Settings, command: RootCommand) -> CliResult<CommandOutput> {
    let missing = settings.missing_required();
    if !missing.is_empty() {
        return Err(store_error(StoreError::NeedsConfiguration { missing }));
    }

    let credentials = resolve_credentials(settings)?;
    let client = GraphClient::new(
        settings.graph_base_url.as_str(),
        request_timeout(settings),
        credentials,
    )
    .map_err(store_error)?;
    let list = ListEndpoints::new(settings.site_id.as_str(), settings.list_id.as_str());
    let mut store = TaskStore::new(client, list).with_page_size(settings.page_size);

    execute_with_store(&mut store, settings, command).await
}

fn init_settings(config_path: Option<&Path>, args: InitArgs) -> CliResult<CommandOutput> {
    let path: PathBuf = match config_path {
        Some(path) => path.to_path_buf(),
        None => Settings::config_path()
            .ok_or_else(|| runtime_error("unable to determine config path"))?,
    };
    if path.exists() && !args.force {
        return Err(usage_error(
            "SETTINGS_EXIST",
            format!(
                "settings file '{}' already exists; pass --force to replace it",
                path.display()
            ),
        ));
    }

    let template = Settings::template();
    template.save_to_path(&path).map_err(runtime_error)?;
    info!(path = %path.display(), "settings template written");

    let missing = template.missing_required();
    Ok(CommandOutput {
        command: "init",
        text: format!(
            "Wrote {}\nFill in: {}",
            path.display(),
            missing.join(", ")
        ),
        data: json!({ "path": path.display().to_string(), "missing": missing }),
    })
}

fn request_timeout(settings: &Settings) -> Duration {
    Duration::from_millis(settings.request_timeout_ms)
}

fn resolve_credentials(settings: &Settings) -> CliResult<Credentials> {
    if let Some(token) = settings.access_token() {
        return Ok(Credentials::Static(StaticTokenProvider::new(token)));
    }

    if let Some(refresh_token) = settings.refresh_token() {
        let http = Client::builder()
            .timeout(request_timeout(settings))
            .build()
            .map_err(runtime_error)?;
        return Ok(Credentials::Refresh(RefreshTokenProvider::new(
            http,
            &settings.tenant_id,
            settings.client_id.as_str(),
            refresh_token,
        )));
    }

    Err(store_error(StoreError::NeedsConfiguration {
        missing: vec![format!("{ACCESS_TOKEN_ENV} or {REFRESH_TOKEN_ENV}")],
    }))
}

async fn execute_with_store<T: Transport + Sync>(
    store: &mut TaskStore<T>,
    settings: &Settings,
    command: RootCommand,
) -> CliResult<CommandOutput> {
    match command {
        RootCommand::List(args) => task_list(store, settings, args).await,
        RootCommand::Create(args) => task_create(store, args).await,
        RootCommand::Update(args) => task_update(store, args).await,
        RootCommand::Delete(args) => task_delete(store, args).await,
        RootCommand::Summary => summary(store, settings).await,
        RootCommand::Schema => schema_report(store).await,
        RootCommand::Init(_) => Err(usage_error(
            "INVALID_COMMAND",
            "init writes settings and does not use the list",
        )),
    }
}

async fn task_list<T: Transport + Sync>(
    store: &mut TaskStore<T>,
    settings: &Settings,
    args: ListArgs,
) -> CliResult<CommandOutput> {
    let pole_filter = args.pole.as_deref().map(normalize_pole);
    let status_filter = args.status.as_deref().map(normalize_status);

    let tasks = store.load_tasks().await.map_err(store_error)?;
    let filtered: Vec<&Task> = tasks
        .iter()
        .filter(|task| {
            pole_filter.as_ref().is_none_or(|pole| &task.pole == pole)
                && status_filter.as_ref().is_none_or(|status| &task.status == status)
        })
        .collect();

    let text = render_task_list_text(&filtered, settings);
    let data = json!({ "tasks": filtered });

    Ok(CommandOutput {
        command: "list",
        data,
        text,
    })
}

fn render_task_list_text(tasks: &[&Task], settings: &Settings) -> String {
    if tasks.is_empty() {
        return "No tasks found.".to_string();
    }

    let headers = ["ID", "Pole", "Status", "Priority", "Due", "Title"];
    let rows = tasks
        .iter()
        .map(|task| {
            vec![
                task.id.clone(),
                settings.pole_label(task.pole.as_str()),
                settings.status_label(task.status.as_str()),
                settings.priority_label(task.priority.as_str()),
                short_date(&task.due_date),
                task.title.replace('\n', " "),
            ]
        })
        .collect::<Vec<_>>();

    render_text_table(&headers, &rows)
}

fn short_date(raw: &str) -> String {
    raw.get(..10).unwrap_or(raw).to_string()
}

fn render_text_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths = headers
        .iter()
        .map(|header| header.chars().count())
        .collect::<Vec<_>>();

    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            let width = cell.chars().count();
            if width > widths[index] {
                widths[index] = width;
            }
        }
    }

    let border = format!(
        "+{}+",
        widths
            .iter()
            .map(|width| "-".repeat(*width + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let render_row = |cells: Vec<&str>| {
        format!(
            "| {} |",
            cells
                .iter()
                .enumerate()
                .map(|(index, cell)| format!("{cell:<width$}", width = widths[index]))
                .collect::<Vec<_>>()
                .join(" | ")
        )
    };

    let mut lines = vec![border.clone(), render_row(headers.to_vec()), border.clone()];
    for row in rows {
        lines.push(render_row(row.iter().map(String::as_str).collect()));
    }
    lines.push(border);
    lines.join("\n")
}

async fn task_create<T: Transport + Sync>(
    store: &mut TaskStore<T>,
    args: CreateArgs,
) -> CliResult<CommandOutput> {
    let mut task = NewTask::new(args.title, normalize_pole(args.pole.as_deref().unwrap_or("")));
    if let Some(status) = args.status.as_deref() {
        task.status = normalize_status(status);
    }
    if let Some(priority) = args.priority.as_deref() {
        task.priority = normalize_priority(priority);
    }
    task.due_date = args.due.unwrap_or_default().trim().to_string();
    task.notes = args.notes.unwrap_or_default();
    task.link_url = args.link.unwrap_or_default().trim().to_string();

    let outcome = store.create_task(task).await.map_err(store_error)?;
    let created = outcome.value;
    info!(id = %created.id, "task created from cli");

    let text = with_warnings(
        format!("Created task {}: {}", created.id, created.title),
        &outcome.dropped,
    );
    Ok(CommandOutput {
        command: "create",
        data: json!({ "task": created, "dropped": outcome.dropped }),
        text,
    })
}

async fn task_update<T: Transport + Sync>(
    store: &mut TaskStore<T>,
    args: UpdateArgs,
) -> CliResult<CommandOutput> {
    let update = parse_assignments(&args.assignments)?;
    let sent: BTreeMap<String, Value> = update
        .iter()
        .map(|(field, value)| (field.canonical_key().to_string(), value.clone()))
        .collect();

    let outcome = store
        .update_task_fields(&args.id, update)
        .await
        .map_err(|err| task_error(&args.id, err))?;

    let text = with_warnings(format!("Updated task {}", args.id), &outcome.dropped);
    Ok(CommandOutput {
        command: "update",
        data: json!({ "id": args.id, "fields": sent, "dropped": outcome.dropped }),
        text,
    })
}

fn parse_assignments(assignments: &[String]) -> CliResult<BTreeMap<LogicalField, Value>> {
    let mut update = BTreeMap::new();
    for assignment in assignments {
        let Some((name, raw)) = assignment.split_once('=') else {
            return Err(usage_error(
                "INVALID_ASSIGNMENT",
                format!("expected FIELD=VALUE, got '{assignment}'"),
            ));
        };
        let Some(field) = LogicalField::parse(name) else {
            return Err(usage_error(
                "UNKNOWN_FIELD",
                format!("unknown field '{}'", name.trim()),
            ));
        };

        let value = match field {
            LogicalField::SortOrder => {
                let number = raw.trim().parse::<f64>().map_err(|_| {
                    usage_error(
                        "INVALID_VALUE",
                        format!("SortOrder must be a number, got '{raw}'"),
                    )
                })?;
                json!(number)
            }
            LogicalField::Pole => json!(normalize_pole(raw).as_str()),
            LogicalField::Status => json!(normalize_status(raw).as_str()),
            LogicalField::Priority => json!(normalize_priority(raw).as_str()),
            _ => json!(raw),
        };
        update.insert(field, value);
    }
    Ok(update)
}

async fn task_delete<T: Transport + Sync>(
    store: &mut TaskStore<T>,
    args: DeleteArgs,
) -> CliResult<CommandOutput> {
    store
        .delete_task(&args.id)
        .await
        .map_err(|err| task_error(&args.id, err))?;

    Ok(CommandOutput {
        command: "delete",
        data: json!({ "id": args.id, "deleted": true }),
        text: format!("Deleted task {}", args.id),
    })
}

async fn summary<T: Transport + Sync>(
    store: &mut TaskStore<T>,
    settings: &Settings,
) -> CliResult<CommandOutput> {
    let tasks = store.load_tasks().await.map_err(store_error)?;
    let sync = classify_sync(tasks);
    info!(outcome = ?sync, "sync finished");
    let now = Utc::now();

    let mut poles = Vec::new();
    let mut lines = vec![sync_line(sync)];
    for entry in &settings.poles {
        let pole = normalize_pole(&entry.key);
        let kpis = pole_kpis(tasks, &pole, now);
        let top = top_tasks(tasks, &pole, DEFAULT_TOP_TASKS);

        let heading = match settings.pole_emoji(&entry.key) {
            Some(emoji) => format!("{emoji} {}", entry.label),
            None => entry.label.clone(),
        };
        lines.push(String::new());
        lines.push(format!(
            "{heading}: {} open, {} in progress, {} due within 7 days ({} total)",
            kpis.open, kpis.in_progress, kpis.due_soon, kpis.total
        ));
        for task in &top {
            let due = match short_date(&task.due_date) {
                due if due.is_empty() => String::new(),
                due => format!(" (due {due})"),
            };
            lines.push(format!(
                "  - [{}] {}{due}",
                settings.status_label(task.status.as_str()),
                task.title
            ));
        }

        poles.push(json!({
            "key": entry.key,
            "label": entry.label,
            "emoji": settings.pole_emoji(&entry.key),
            "kpis": kpis,
            "top": top,
        }));
    }

    Ok(CommandOutput {
        command: "summary",
        data: json!({ "sync": sync, "poles": poles }),
        text: lines.join("\n"),
    })
}

fn sync_line(sync: SyncOutcome) -> String {
    match sync {
        SyncOutcome::Empty => "Sync OK, but the list returned no tasks.".to_string(),
        SyncOutcome::Unclassified => {
            "Sync OK, but no task has a pole; check the Pole column.".to_string()
        }
        SyncOutcome::Synced(count) => format!("Synced {count} tasks."),
    }
}

async fn schema_report<T: Transport + Sync>(store: &mut TaskStore<T>) -> CliResult<CommandOutput> {
    let schema = store.ensure_schema().await;
    let resolution = schema.resolution();

    let fields = [LogicalField::Title]
        .into_iter()
        .chain(LogicalField::RESOLVED)
        .map(|field| (field, resolution.get(field).map(str::to_string)))
        .collect::<Vec<_>>();

    let mut text = String::new();
    if schema.is_degraded() {
        text.push_str("warning: list columns could not be read; optional fields are disabled\n");
    }
    let rows = fields
        .iter()
        .map(|(field, column)| {
            vec![
                field.to_string(),
                column.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect::<Vec<_>>();
    text.push_str(&render_text_table(&["Field", "Column"], &rows));

    let data = json!({
        "degraded": schema.is_degraded(),
        "columns": schema.known_columns(),
        "resolution": fields
            .iter()
            .map(|(field, column)| (field.to_string(), json!(column)))
            .collect::<serde_json::Map<_, _>>(),
    });

    Ok(CommandOutput {
        command: "schema",
        data,
        text,
    })
}

fn with_warnings(mut text: String, dropped: &[DroppedField]) -> String {
    for field in dropped {
        text.push_str(&format!("\nwarning: {field}"));
    }
    text
}

fn usage_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 2,
        code,
        message: message.into(),
        details: None,
    }
}

fn not_found_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 3,
        code,
        message: message.into(),
        details: None,
    }
}

fn runtime_error(err: impl std::fmt::Display) -> CliError {
    CliError {
        exit_code: 5,
        code: "RUNTIME_ERROR",
        message: err.to_string(),
        details: None,
    }
}

fn task_error(task_id: &str, err: StoreError) -> CliError {
    if err.is_not_found() {
        return not_found_error("TASK_NOT_FOUND", format!("task {task_id} not found"));
    }
    store_error(err)
}

fn store_error(err: StoreError) -> CliError {
    match err {
        StoreError::NeedsConfiguration { ref missing } => CliError {
            exit_code: 3,
            code: "NEEDS_CONFIGURATION",
            details: Some(json!({ "missing": missing })),
            message: err.to_string(),
        },
        StoreError::EmptyTitle => usage_error("EMPTY_TITLE", err.to_string()),
        StoreError::Auth(_) => CliError {
            code: "AUTH_FAILED",
            ..runtime_error(&err)
        },
        StoreError::Http { status, ref body } => CliError {
            code: if status == 404 { "NOT_FOUND" } else { "GRAPH_ERROR" },
            exit_code: if status == 404 { 3 } else { 5 },
            message: format!("Graph request failed with HTTP {status}"),
            details: Some(json!({ "status": status, "body": compact_body(body) })),
        },
        other => runtime_error(other),
    }
}

fn compact_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn print_success(output: CommandOutput, json_output: bool, quiet: bool) {
    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "command": output.command,
            "data": output.data
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => println!("{value}"),
            Err(_) => println!("{}", payload),
        }
        return;
    }

    if quiet {
        return;
    }

    if output.text.is_empty() {
        println!("ok");
    } else {
        println!("{}", output.text);
    }
}

fn print_error(err: &CliError, json_output: bool) {
    error!(
        code = err.code,
        message = %err.message,
        details = ?err.details,
        "cli command failed"
    );

    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "error": {
                "code": err.code,
                "message": err.message,
                "details": err.details
            }
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => eprintln!("{value}"),
            Err(_) => eprintln!("{}", payload),
        }
        return;
    }

    eprintln!("error[{}]: {}", err.code, err.message);
    if err.code == "NEEDS_CONFIGURATION" {
        let path = Settings::config_path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "settings.toml".to_string());
        eprintln!("hint: set the missing values in {path}");
    }
}
