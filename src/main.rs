mod audit;
mod auth;
mod backup;
mod billing;
mod calc;
mod config;
mod db;
mod error;
mod ipc;
mod logging;
mod notify;
mod ops;
mod reports;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "escolad")]
#[command(about = "School administration sidecar: JSON-lines IPC and maintenance jobs")]
#[command(version)]
struct Cli {
    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = logging::default_log_level())]
    log_level: String,
    /// Absolute directory for rotated log files (default: stderr)
    #[arg(long, global = true)]
    log_dir: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests over stdin/stdout (default)
    Serve,
    /// Write one workspace backup and record it in the backup log
    Backup {
        #[arg(long)]
        workspace: PathBuf,
        /// Username recorded as the executor
        #[arg(long)]
        user: Option<String>,
    },
    /// Back up, close the open exercise and activate another academic year
    ExerciseSwitch {
        #[arg(long)]
        workspace: PathBuf,
        /// Id of the academic year to activate
        #[arg(long)]
        year: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Send reminders for overdue invoices to each guardian
    NotifyOverdue {
        #[arg(long)]
        workspace: PathBuf,
    },
}

fn serve() {
    let mut state = ipc::AppState::default();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let resp = ipc::error::err("", "bad_json", e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("event=serve_stop module=main status=ok");
}

fn print_json(v: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
    );
}

fn open(workspace: &Path) -> anyhow::Result<rusqlite::Connection> {
    db::open_db(workspace).with_context(|| format!("open workspace {}", workspace.display()))
}

fn run(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Serve => {
            serve();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backup { workspace, user } => {
            let conn = open(&workspace)?;
            let outcome = ops::run_backup(&conn, &workspace, user.as_deref())?;
            print_json(&outcome.to_json());
            Ok(if outcome.succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::ExerciseSwitch {
            workspace,
            year,
            user,
        } => {
            let conn = open(&workspace)?;
            let switched = ops::switch_exercise(&conn, &workspace, &year, user.as_deref())?;
            print_json(&switched.to_json());
            Ok(ExitCode::SUCCESS)
        }
        Commands::NotifyOverdue { workspace } => {
            let conn = open(&workspace)?;
            let today = chrono::Local::now().date_naive();
            let summary = ops::notify_overdue(&conn, today)?;
            print_json(&summary.to_json());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init_logging(&cli.log_level, cli.log_dir.as_deref()) {
        eprintln!("escolad: {e}");
        return ExitCode::from(2);
    }

    match run(cli.command.unwrap_or(Commands::Serve)) {
        Ok(code) => code,
        Err(e) => {
            error!("event=command_failed module=main status=error");
            eprintln!("escolad: {e:#}");
            ExitCode::FAILURE
        }
    }
}
