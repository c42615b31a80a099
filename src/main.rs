use std::{panic, path::PathBuf};

use anyhow::Result;
use clap::Parser;

use cockpit_tasks::{
    cli::{self, RootCommand},
    logging::init_logging,
    settings::Settings,
};

#[derive(Parser, Debug)]
#[command(
    name = "cockpit-tasks",
    about = "Track pole tasks stored in a Microsoft List",
    long_about = "Lists, creates and edits tasks kept in a Microsoft Lists table, mapping whatever columns the list has onto poles, statuses and priorities.",
    version = env!("COCKPIT_TASKS_BUILD_VERSION"),
    author
)]
struct Cli {
    /// Read settings from this file instead of the user config directory.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: RootCommand,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_path = match init_logging() {
        Ok(path) => Some(path),
        Err(err) => {
            eprintln!("warning: failed to initialize logging: {err}");
            None
        }
    };
    if let Some(path) = log_path {
        install_panic_hook_with_log(path);
    }

    let cli = Cli::parse();
    let settings = match cli.config.as_deref() {
        Some(path) => Settings::load_from_path(path),
        None => Settings::load(),
    };

    let code = cli::run(&settings, cli.config.as_deref(), cli.command, cli.json, cli.quiet).await;
    std::process::exit(code);
}

fn install_panic_hook_with_log(log_path: PathBuf) {
    let previous_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        eprintln!();
        eprintln!("  Log file: {}", log_path.display());
        eprintln!();
        previous_hook(panic_info);
    }));
}
