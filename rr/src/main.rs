//! rr - command-line front end for the record store
//!
//! Manages clients, jobs and tasks in a SQLite store and can follow a live
//! view of jobs or tasks through a reactive coordinator.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use reactiverecord::cli::{Cli, ClientCommand, Command, JobCommand, OutputFormat, ScopeArgs, TaskCommand, WatchTarget};
use reactiverecord::config::Config;
use reactiverecord::domain::{Client, Job, NewClient, NewJob, NewTask, Task};
use reactiverecord::{
    ActiveRecord, Connection, CoordinatorState, CoordinatorStatus, Patch, ReactiveCoordinator, ReactiveRecord,
    ScopedQuery,
};
use recordstore::{Record, SqliteBackend};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reactiverecord")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("rr.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store_path = cli.store.clone().unwrap_or_else(|| config.store_path.clone());
    debug!(store = %store_path.display(), command = ?cli.command, "main: dispatching command");

    let backend = SqliteBackend::open(&store_path)
        .with_context(|| format!("Failed to open store at {}", store_path.display()))?;
    let conn = Connection::connected(Arc::new(backend));

    match cli.command {
        Command::Client { command } => cmd_client(&conn, command).await,
        Command::Job { command } => cmd_job(&conn, command).await,
        Command::Task { command } => cmd_task(&conn, command).await,
        Command::Watch { target, job, seconds } => cmd_watch(&conn, &config, target, job, seconds).await,
    }
}

fn scoped<T: Record>(model: &ActiveRecord<T>, scope: ScopeArgs) -> ScopedQuery<T> {
    if scope.all {
        model.with_discarded()
    } else if scope.discarded {
        model.discarded()
    } else {
        model.kept()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn discarded_marker(discarded_at: Option<i64>) -> ColoredString {
    match discarded_at {
        Some(_) => " (discarded)".red(),
        None => "".normal(),
    }
}

async fn cmd_client(conn: &Connection, command: ClientCommand) -> Result<()> {
    let clients = ActiveRecord::<Client>::new(conn.clone())?;
    match command {
        ClientCommand::Add {
            name,
            client_type,
            email,
            phone,
        } => {
            let mut data = NewClient::new(name, client_type);
            data.email = email;
            data.phone = phone;
            let client = clients.create(&data).await?;
            println!("{} Created client: {}", "✓".green(), client.id.cyan());
        }
        ClientCommand::List { scope, format } => {
            let records = scoped(&clients, scope).all().await?;
            match format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Text if records.is_empty() => println!("No clients found"),
                OutputFormat::Text => {
                    for c in records {
                        println!(
                            "{} {} [{}]{}",
                            c.id.yellow(),
                            c.name.bold(),
                            c.client_type.to_string().dimmed(),
                            discarded_marker(c.discarded_at)
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

async fn cmd_job(conn: &Connection, command: JobCommand) -> Result<()> {
    let jobs = ActiveRecord::<Job>::new(conn.clone())?;
    match command {
        JobCommand::Add {
            client,
            title,
            description,
            status,
        } => {
            // the client must exist
            ActiveRecord::<Client>::new(conn.clone())?.find(&client).await?;
            let mut data = NewJob::new(client, title).status(status);
            data.description = description;
            let job = jobs.create(&data).await?;
            println!("{} Created job: {}", "✓".green(), job.id.cyan());
        }
        JobCommand::List {
            client,
            status,
            scope,
            format,
        } => {
            let mut query = scoped(&jobs, scope);
            if let Some(client) = client {
                query = query.where_eq("client_id", client);
            }
            if let Some(status) = status {
                query = query.where_eq("status", status.to_string());
            }
            let records = query.all().await?;
            match format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Text if records.is_empty() => println!("No jobs found"),
                OutputFormat::Text => {
                    for j in records {
                        println!(
                            "{} {} [{}]{}",
                            j.id.yellow(),
                            j.title.bold(),
                            j.status.to_string().cyan(),
                            discarded_marker(j.discarded_at)
                        );
                    }
                }
            }
        }
        JobCommand::Show { id, format } => {
            let job = jobs
                .with_discarded()
                .where_eq("id", id.as_str())
                .includes(&["client", "tasks"])?
                .first()
                .await?
                .ok_or_else(|| reactiverecord::RecordError::not_found("jobs", &id))?;
            match format {
                OutputFormat::Json => print_json(&job)?,
                OutputFormat::Text => {
                    println!("Job: {}{}", job.title.bold(), discarded_marker(job.discarded_at));
                    println!("  Id: {}", job.id.yellow());
                    println!("  Status: {}", job.status.to_string().cyan());
                    if let Some(description) = &job.description {
                        println!("  Description: {}", description);
                    }
                    if let Some(client) = &job.client {
                        println!("  Client: {} ({})", client.name, client.client_type);
                    }
                    let tasks = job.tasks.clone().unwrap_or_default();
                    println!("  Tasks: {}", tasks.len());
                    print_task_tree(&tasks, 2);
                }
            }
        }
        JobCommand::Update {
            id,
            title,
            description,
            status,
        } => {
            let mut patch = Patch::new();
            if let Some(title) = title {
                patch.insert("title", title);
            }
            if let Some(description) = description {
                patch.insert("description", description);
            }
            if let Some(status) = status {
                patch.insert("status", status.to_string());
            }
            let job = jobs.update(&id, patch).await?;
            println!("{} Updated job: {}", "✓".green(), job.id.cyan());
        }
        JobCommand::Discard { id } => {
            jobs.discard(&id).await?;
            println!("{} Discarded job: {}", "✓".green(), id.cyan());
        }
        JobCommand::Undiscard { id } => {
            jobs.undiscard(&id).await?;
            println!("{} Restored job: {}", "✓".green(), id.cyan());
        }
        JobCommand::Destroy { id } => {
            let destroyed = jobs.destroy(&id).await?;
            println!("{} Destroyed job: {}", "✓".green(), destroyed.id.cyan());
        }
    }
    Ok(())
}

async fn cmd_task(conn: &Connection, command: TaskCommand) -> Result<()> {
    let tasks = ActiveRecord::<Task>::new(conn.clone())?;
    match command {
        TaskCommand::Add {
            job,
            title,
            parent,
            status,
        } => {
            ActiveRecord::<Job>::new(conn.clone())?.find(&job).await?;
            let mut data = NewTask::new(job, title).status(status);
            data.parent_id = parent;
            let task = tasks.append(data).await?;
            println!(
                "{} Created task: {} at {}",
                "✓".green(),
                task.id.cyan(),
                task.position.to_string().dimmed()
            );
        }
        TaskCommand::List { job, format } => {
            let records = tasks.kept().where_eq("job_id", job).all().await?;
            match format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Text if records.is_empty() => println!("No tasks found"),
                OutputFormat::Text => print_task_tree(&records, 0),
            }
        }
        TaskCommand::Move { id, index, parent } => {
            let task = tasks.reorder(&id, parent.as_deref(), index).await?;
            println!(
                "{} Moved task: {} to {}",
                "✓".green(),
                task.id.cyan(),
                task.position.to_string().dimmed()
            );
        }
    }
    Ok(())
}

/// Print tasks (sorted by position) nested under their parents
fn print_task_tree(tasks: &[Task], indent: usize) {
    let mut children: HashMap<Option<&str>, Vec<&Task>> = HashMap::new();
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        // orphans (parent outside this set) print at the top level
        let parent = task.parent_id.as_deref().filter(|p| ids.contains(p));
        children.entry(parent).or_default().push(task);
    }

    fn walk<'a>(children: &HashMap<Option<&'a str>, Vec<&'a Task>>, parent: Option<&'a str>, depth: usize) {
        for &task in children.get(&parent).into_iter().flatten() {
            println!(
                "{}{} {} [{}]",
                "  ".repeat(depth),
                task.id.yellow(),
                task.title,
                task.status.to_string().cyan()
            );
            walk(children, Some(task.id.as_str()), depth + 1);
        }
    }
    walk(&children, None, indent);
}

fn describe<T>(state: &CoordinatorState<T>) -> String {
    match state.status {
        CoordinatorStatus::Initializing => "initializing".yellow().to_string(),
        CoordinatorStatus::Hydrating => format!("{} ({} shown)", "hydrating".yellow(), state.display_len()),
        CoordinatorStatus::Ready if state.should_show_empty => format!("{} (empty)", "ready".green()),
        CoordinatorStatus::Ready => format!("{} ({} records)", "ready".green(), state.display_len()),
        CoordinatorStatus::Error => {
            let reason = state.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
            format!("{} {}", "error".red(), reason)
        }
    }
}

async fn follow<T: Record>(coordinator: ReactiveCoordinator<T>, seconds: u64) -> Result<()> {
    let mut rx = coordinator.watch();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    let mut last = None;

    loop {
        let state = rx.borrow_and_update().clone();
        let line = describe(&state);
        if last.as_ref() != Some(&line) {
            println!("{}", line);
            last = Some(line);
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
    coordinator.destroy();
    Ok(())
}

async fn cmd_watch(
    conn: &Connection,
    config: &Config,
    target: WatchTarget,
    job: Option<String>,
    seconds: u64,
) -> Result<()> {
    info!(?target, seconds, "Watching");
    match target {
        WatchTarget::Jobs => {
            let jobs = ReactiveRecord::<Job>::new(conn.clone())?
                .with_retry(config.retry.clone())
                .with_coordinator_config(config.coordinator.clone());
            follow(jobs.coordinate(jobs.all()), seconds).await
        }
        WatchTarget::Tasks => {
            let tasks = ReactiveRecord::<Task>::new(conn.clone())?
                .with_retry(config.retry.clone())
                .with_coordinator_config(config.coordinator.clone());
            let query = match job {
                Some(job) => tasks.where_eq("job_id", job),
                None => tasks.all(),
            };
            follow(tasks.coordinate(query), seconds).await
        }
    }
}
