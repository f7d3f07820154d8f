//! Console front end: prompts, plan and result rendering, and a progress bar sink.

use std::fmt::Write as _;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tracing::warn;

use crate::app::App;
use crate::events::{self, FileSink, LogLine, MultiSink, ProgressSink};
use crate::state::backup_flow::ContainerRole;
use crate::types::{AppState, BackupPlan, BackupResult, ContainerDescriptor, RunStatus, StepKind};

const BAR_LENGTH: u64 = 1000;

/// What the user asked for on the command line, beyond the persisted settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub app_container: Option<String>,
    pub db_container: Option<String>,
    pub scan_only: bool,
    pub delete_remote_archive: bool,
    pub assume_yes: bool,
    pub log_file: Option<PathBuf>,
}

/// Progress bar on a terminal, plain lines otherwise.
pub struct ConsoleSink {
    bar: Option<ProgressBar>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        if !io::stdout().is_terminal() {
            return Self { bar: None };
        }

        let bar = ProgressBar::new(BAR_LENGTH);
        let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar: Some(bar) }
    }

    pub fn plain() -> Self {
        Self { bar: None }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleSink {
    fn log_line(&mut self, line: &LogLine) {
        match &self.bar {
            Some(bar) => bar.println(line.render()),
            None => println!("{}", line.render()),
        }
    }

    fn progress(&mut self, fraction: f64) {
        if let Some(bar) = &self.bar {
            bar.set_position((fraction * BAR_LENGTH as f64).round() as u64);
        }
    }

    fn step_started(&mut self, step: StepKind) {
        if let Some(bar) = &self.bar {
            bar.set_message(step.display_name().to_string());
        }
    }

    fn transfer(&mut self, bytes: u64, total: u64) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!(
                "{} {} / {}",
                StepKind::Download.display_name(),
                HumanBytes(bytes),
                HumanBytes(total)
            ));
        }
    }

    fn finished(&mut self, status: RunStatus) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(status.as_str().to_string());
        }
    }
}

/// Parses a 1-based menu choice into an index below `count`.
pub fn parse_choice(input: &str, count: usize) -> Option<usize> {
    match input.trim().parse::<usize>() {
        Ok(n) if n >= 1 && n <= count => Some(n - 1),
        _ => None,
    }
}

/// `y`/`yes` in any case confirms; everything else, including an empty line, declines.
pub fn parse_confirmation(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

pub fn render_containers(containers: &[ContainerDescriptor]) -> String {
    let mut out = String::new();
    for (i, c) in containers.iter().enumerate() {
        let _ = writeln!(out, "{:>3}. {} {}", i + 1, c.display(), short_id(&c.id));
        for (inside, host) in &c.mounts {
            let _ = writeln!(out, "       {inside} -> {host}");
        }
    }
    out
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

pub fn render_plan(plan: &BackupPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Backup plan {}", plan.backup_name());
    let _ = writeln!(out, "  application: {}", plan.app_container().display());
    let _ = writeln!(out, "  database:    {}", plan.db_container().display());
    let _ = writeln!(out, "  remote temp: {}", plan.temp_dir());
    let _ = writeln!(out, "  archive:     {}", plan.remote_archive());
    let _ = writeln!(out, "  saved to:    {}", plan.local_archive().display());
    for (i, step) in plan.steps().iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, step.kind.display_name());
        if step.kind == StepKind::Download {
            let _ = writeln!(out, "     download {} to {}", plan.remote_archive(), plan.local_archive().display());
        }
        for command in &step.commands {
            let _ = writeln!(out, "     $ {command}");
        }
    }
    out
}

pub fn render_result(result: &BackupResult) -> String {
    let mut out = String::new();
    let elapsed = result.finished_at - result.started_at;
    let _ = writeln!(
        out,
        "Backup {} after {}s",
        result.status.as_str(),
        elapsed.num_seconds().max(0)
    );
    if let Some(local) = &result.archive_local_path {
        let _ = writeln!(out, "  saved to: {}", local.display());
    }
    if let Some(remote) = &result.archive_remote_path {
        let _ = writeln!(out, "  remote archive: {remote}");
    }
    if let Some(error) = &result.error {
        let _ = writeln!(out, "  error: {error}");
    }
    if let Some(error) = &result.cleanup_error {
        let _ = writeln!(out, "  cleanup error: {error}");
    }
    out
}

async fn prompt(question: &str) -> Result<String> {
    print!("{question}");
    io::stdout().flush()?;

    let (read, line) = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|n| (n, line))
    })
    .await?
    .context("Failed to read from stdin")?;
    if read == 0 {
        bail!("stdin closed");
    }
    Ok(line)
}

async fn confirm(question: &str) -> Result<bool> {
    Ok(parse_confirmation(&prompt(&format!("{question} [y/N] ")).await?))
}

/// Settles the container for `role`: named on the command line, auto-selected, or picked from a list.
async fn choose_container(app: &mut App, role: ContainerRole, named: Option<&str>) -> Result<()> {
    if let Some(name) = named {
        if !app.flow.select_by_name(role, name) {
            bail!("No running container named {name}");
        }
        return Ok(());
    }
    if let Some(selected) = app.flow.selected(role) {
        println!("Using {} container {}", role.label(), selected.display());
        return Ok(());
    }

    let candidates = app.flow.candidates(role);
    if candidates.is_empty() {
        bail!("No {} container available", role.label());
    }
    println!("Choose the {} container:", role.label());
    for (i, c) in candidates.iter().enumerate() {
        println!("{:>3}. {}", i + 1, c.display());
    }
    let count = candidates.len();

    loop {
        let answer = prompt("> ").await?;
        match parse_choice(&answer, count) {
            Some(choice) => {
                app.flow.choose_candidate(role, choice);
                return Ok(());
            }
            None => println!("Enter a number between 1 and {count}"),
        }
    }
}

/// Connects, scans, selects, then runs (or previews) one backup. Returns the run status.
pub async fn run(app: &mut App, options: &RunOptions) -> Result<RunStatus> {
    app.connect().await?;
    if let AppState::Error(message) = &app.state {
        bail!("{message}");
    }

    let result = run_connected(app, options).await;
    app.disconnect().await;
    result
}

async fn run_connected(app: &mut App, options: &RunOptions) -> Result<RunStatus> {
    app.scan_containers().await?;
    if let AppState::Error(message) = &app.state {
        bail!("{message}");
    }

    if options.scan_only {
        print!("{}", render_containers(&app.flow.containers));
        return Ok(RunStatus::Success);
    }

    choose_container(app, ContainerRole::App, options.app_container.as_deref()).await?;
    choose_container(app, ContainerRole::Database, options.db_container.as_deref()).await?;

    if app.dry_run_mode {
        let plan = app.build_plan()?;
        print!("{}", render_plan(&plan));
        println!("Dry run: nothing was executed.");
        return Ok(RunStatus::Success);
    }

    let mut handle = app.start_backup()?;
    let events = handle.take_events().context("Event stream already taken")?;

    let token = handle.cancel_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after the current step...");
            token.cancel();
        }
    });

    let mut sink = MultiSink::new();
    sink.push(Box::new(ConsoleSink::new()));
    if let Some(path) = &options.log_file {
        match FileSink::open(path) {
            Ok(file) => sink.push(Box::new(file)),
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot open log file"),
        }
    }
    events::drain(events, &mut sink).await;

    let result = handle.finish().await.context("Backup task panicked")?;
    ctrl_c.abort();

    print!("{}", render_result(&result));
    let status = result.status;
    let downloaded = result.archive_local_path.is_some();
    app.finish_backup(result);

    if downloaded {
        let delete = options.delete_remote_archive
            || (!options.assume_yes && confirm("Delete the archive from the server?").await?);
        if delete {
            app.delete_server_backup().await?;
            println!("Remote archive deleted.");
        }
    }

    Ok(status)
}
