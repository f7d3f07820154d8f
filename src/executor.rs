//! Backup executor.
//!
//! A run is an explicit state machine driven by [`next`]. Every work step runs
//! to completion or failure, cancellation is only honoured between steps, and
//! the cleanup step runs whatever happened before it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::cleanup::{self, CleanupScope};
use crate::error::{BackupError, BusyError, StepExecutionError, StepFailure, TransferError};
use crate::events::{BackupEvent, EventStream, LogLevel, Reporter};
use crate::plan::create_dir_command;
use crate::remote::ProgressFn;
use crate::session::Session;
use crate::settings::BackupProfile;
use crate::transfer;
use crate::types::{BackupPlan, BackupResult, RunStatus, Step, StepKind};

/// How the work steps ended, carried through cleanup.
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    Failed(BackupError),
}

#[derive(Debug)]
pub enum RunState {
    Idle,
    /// Index into the plan's work steps.
    Running { step: usize },
    Succeeded,
    Failed(BackupError),
    Cleanup { outcome: Outcome },
    Terminal {
        outcome: Outcome,
        cleanup: Option<StepExecutionError>,
    },
}

#[derive(Debug)]
pub enum RunEvent {
    Start,
    StepSucceeded,
    StepFailed(BackupError),
    CancelRequested,
    BeginCleanup,
    CleanupFinished(Result<(), StepExecutionError>),
}

/// The single transition function. Pairs with no transition leave the state unchanged.
pub fn next(state: RunState, event: RunEvent, work: &[StepKind]) -> RunState {
    let step_kind = |i: usize| work.get(i).copied().unwrap_or(StepKind::Cleanup);

    match (state, event) {
        (RunState::Idle, RunEvent::Start) if work.is_empty() => RunState::Succeeded,
        (RunState::Idle, RunEvent::Start) => RunState::Running { step: 0 },
        (RunState::Idle, RunEvent::CancelRequested) => {
            RunState::Failed(BackupError::Cancelled { before: step_kind(0) })
        }
        (RunState::Running { step }, RunEvent::StepSucceeded) if step + 1 < work.len() => {
            RunState::Running { step: step + 1 }
        }
        (RunState::Running { .. }, RunEvent::StepSucceeded) => RunState::Succeeded,
        (RunState::Running { .. }, RunEvent::StepFailed(cause)) => RunState::Failed(cause),
        (RunState::Running { step }, RunEvent::CancelRequested) => {
            RunState::Failed(BackupError::Cancelled { before: step_kind(step) })
        }
        (RunState::Succeeded, RunEvent::BeginCleanup) => RunState::Cleanup {
            outcome: Outcome::Succeeded,
        },
        (RunState::Failed(cause), RunEvent::BeginCleanup) => RunState::Cleanup {
            outcome: Outcome::Failed(cause),
        },
        (RunState::Cleanup { outcome }, RunEvent::CleanupFinished(result)) => RunState::Terminal {
            outcome,
            cleanup: result.err(),
        },
        (state, event) => {
            debug!(state = ?state, event = ?event, "Ignoring event with no transition");
            state
        }
    }
}

pub fn final_status(outcome: &Outcome, cleanup: Option<&StepExecutionError>) -> RunStatus {
    match (outcome, cleanup) {
        (Outcome::Succeeded, None) => RunStatus::Success,
        (Outcome::Succeeded, Some(_)) => RunStatus::PartialFailure,
        (Outcome::Failed(_), _) => RunStatus::Failure,
    }
}

/// What a run has produced so far; decides what cleanup may touch.
#[derive(Debug)]
struct RunContext {
    archive_remote: Option<String>,
    archive_local: Option<PathBuf>,
    archive_started: bool,
    /// False when `mkdir` found the temp dir already there: it is not ours to remove.
    owns_temp_dir: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            archive_remote: None,
            archive_local: None,
            archive_started: false,
            owns_temp_dir: true,
        }
    }
}

/// A run in flight on a background task.
pub struct RunHandle {
    events: Option<EventStream>,
    cancel: CancellationToken,
    join: JoinHandle<BackupResult>,
}

impl RunHandle {
    /// The event stream; `None` once taken.
    pub fn take_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    /// Requests a stop before the next step. The step in flight still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn finish(self) -> Result<BackupResult, JoinError> {
        self.join.await
    }
}

#[derive(Clone)]
pub struct Executor {
    session: Session,
    command_timeout: Duration,
    scope: CleanupScope,
}

impl Executor {
    pub fn new(session: Session, profile: &BackupProfile) -> Self {
        Self {
            session,
            command_timeout: profile.command_timeout(),
            scope: CleanupScope::from_profile(profile),
        }
    }

    /// Spawns the run off the caller's task. Fails fast if the session already has a run.
    pub fn start(&self, plan: BackupPlan) -> Result<RunHandle, BusyError> {
        let guard = self.session.try_begin_run()?;
        let (reporter, events) = Reporter::channel();
        let cancel = CancellationToken::new();

        let span = info_span!("backup", name = %plan.backup_name());
        let executor = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(
            async move {
                let _guard = guard;
                executor.drive(plan, reporter, token).await
            }
            .instrument(span),
        );

        Ok(RunHandle {
            events: Some(events),
            cancel,
            join,
        })
    }

    /// Runs the plan on the current task.
    pub async fn run(
        &self,
        plan: BackupPlan,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Result<BackupResult, BusyError> {
        let _guard = self.session.try_begin_run()?;
        Ok(self.drive(plan, reporter, cancel).await)
    }

    async fn drive(&self, plan: BackupPlan, mut reporter: Reporter, cancel: CancellationToken) -> BackupResult {
        let started_at = Utc::now();
        let work: Vec<StepKind> = plan.work_steps().iter().map(|s| s.kind).collect();
        let total = plan.steps().len().max(1) as f64;
        let mut ctx = RunContext::default();

        reporter.info(
            None,
            format!(
                "Starting backup {} on {} ({} steps)",
                plan.backup_name(),
                self.session.target(),
                plan.steps().len()
            ),
        );

        let mut state = next(RunState::Idle, RunEvent::Start, &work);
        let (outcome, cleanup_error) = loop {
            state = match state {
                RunState::Idle => next(RunState::Idle, RunEvent::Start, &work),
                RunState::Running { step } if cancel.is_cancelled() => {
                    reporter.warn(Some(work[step]), "Cancellation requested, skipping remaining steps");
                    next(RunState::Running { step }, RunEvent::CancelRequested, &work)
                }
                RunState::Running { step } => {
                    let event = match self.run_step(&plan, &plan.work_steps()[step], &mut reporter, &mut ctx).await {
                        Ok(()) => {
                            reporter.progress((step + 1) as f64 / total);
                            RunEvent::StepSucceeded
                        }
                        Err(cause) => RunEvent::StepFailed(cause),
                    };
                    next(RunState::Running { step }, event, &work)
                }
                RunState::Succeeded => next(RunState::Succeeded, RunEvent::BeginCleanup, &work),
                RunState::Failed(cause) => {
                    let level = if cause.is_cancelled() {
                        LogLevel::Warn
                    } else {
                        LogLevel::Error
                    };
                    reporter.log(level, cause.step(), cause.to_string());
                    next(RunState::Failed(cause), RunEvent::BeginCleanup, &work)
                }
                RunState::Cleanup { outcome } => {
                    let result = self.run_cleanup(&plan, &mut reporter, &ctx).await;
                    next(RunState::Cleanup { outcome }, RunEvent::CleanupFinished(result), &work)
                }
                RunState::Terminal { outcome, cleanup } => break (outcome, cleanup),
            };
        };

        let status = final_status(&outcome, cleanup_error.as_ref());
        reporter.progress(1.0);
        if let Some(archive) = &ctx.archive_remote {
            reporter.info(None, format!("Remote archive kept at {archive}"));
        }
        let level = match status {
            RunStatus::Success => LogLevel::Info,
            RunStatus::PartialFailure => LogLevel::Warn,
            RunStatus::Failure => LogLevel::Error,
        };
        reporter.log(level, None, format!("Backup finished: {}", status.as_str()));
        reporter.emit(BackupEvent::Finished(status));

        BackupResult {
            status,
            archive_remote_path: ctx.archive_remote,
            archive_local_path: ctx.archive_local,
            log: reporter.into_log(),
            error: match outcome {
                Outcome::Succeeded => None,
                Outcome::Failed(cause) => Some(cause),
            },
            cleanup_error: cleanup_error.map(BackupError::from),
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_step(
        &self,
        plan: &BackupPlan,
        step: &Step,
        reporter: &mut Reporter,
        ctx: &mut RunContext,
    ) -> Result<(), BackupError> {
        reporter.emit(BackupEvent::StepStarted(step.kind));
        reporter.info(Some(step.kind), format!("Starting {}", step.kind.display_name()));

        let result = match step.kind {
            StepKind::Download => self.download(plan, reporter, ctx).await,
            _ => self.run_commands(plan, step, reporter, ctx).await,
        };
        if result.is_ok() && step.kind == StepKind::Archive {
            ctx.archive_remote = Some(plan.remote_archive().to_string());
        }

        reporter.emit(BackupEvent::StepFinished {
            step: step.kind,
            success: result.is_ok(),
        });
        result
    }

    async fn run_commands(
        &self,
        plan: &BackupPlan,
        step: &Step,
        reporter: &mut Reporter,
        ctx: &mut RunContext,
    ) -> Result<(), BackupError> {
        let remote = self.session.remote();
        let mkdir_temp = create_dir_command(plan.temp_dir());
        if step.kind == StepKind::Archive {
            ctx.archive_started = true;
        }

        for command in &step.commands {
            let output = remote
                .execute(command, self.command_timeout)
                .await
                .map_err(|e| StepExecutionError::new(step.kind, e))?;

            log_exit(reporter, step.kind, command, output.exit_code);
            for line in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                reporter.info(Some(step.kind), line);
            }

            if !output.success() {
                if step.kind == StepKind::Prepare && *command == mkdir_temp {
                    ctx.owns_temp_dir = false;
                }
                return Err(StepExecutionError::new(
                    step.kind,
                    StepFailure::NonZeroExit {
                        command: command.clone(),
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    },
                )
                .into());
            }
            for line in output.stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
                reporter.warn(Some(step.kind), line);
            }
        }
        Ok(())
    }

    async fn download(
        &self,
        plan: &BackupPlan,
        reporter: &mut Reporter,
        ctx: &mut RunContext,
    ) -> Result<(), BackupError> {
        let remote = &**self.session.remote();
        let remote_path = plan.remote_archive();

        let stat = transfer::size_command(remote_path);
        let output = remote
            .execute(&stat, self.command_timeout)
            .await
            .map_err(TransferError::from)?;
        log_exit(reporter, StepKind::Download, &stat, output.exit_code);
        let total = transfer::parse_size(remote_path, &output)?;
        reporter.info(
            Some(StepKind::Download),
            format!("Remote archive {remote_path} is {total} bytes"),
        );

        let progress = reporter.sender().map(|tx| {
            let report: ProgressFn = Arc::new(move |bytes: u64| {
                let _ = tx.send(BackupEvent::Transfer { bytes, total });
            });
            report
        });
        let local = transfer::fetch(remote, remote_path, plan.local_archive(), total, progress).await?;

        reporter.info(
            Some(StepKind::Download),
            format!("Saved archive to {}", local.display()),
        );
        ctx.archive_local = Some(local);
        Ok(())
    }

    async fn run_cleanup(
        &self,
        plan: &BackupPlan,
        reporter: &mut Reporter,
        ctx: &RunContext,
    ) -> Result<(), StepExecutionError> {
        let kind = StepKind::Cleanup;
        let remote = &**self.session.remote();
        reporter.emit(BackupEvent::StepStarted(kind));

        let mut result = if ctx.owns_temp_dir {
            reporter.info(Some(kind), format!("Removing {}", plan.temp_dir()));
            let removed =
                cleanup::remove_temp_dir(remote, &self.scope, plan.temp_dir(), self.command_timeout).await;
            log_removal(reporter, &cleanup::remove_dir_command(plan.temp_dir()), &removed);
            removed
        } else {
            reporter.warn(
                Some(kind),
                format!("{} existed before this run, leaving it in place", plan.temp_dir()),
            );
            Ok(())
        };

        // An archive step that did not finish may have left a truncated file behind.
        if ctx.archive_started && ctx.archive_remote.is_none() {
            reporter.info(Some(kind), format!("Removing partial archive {}", plan.remote_archive()));
            let partial =
                cleanup::remove_remote_archive(remote, &self.scope, plan.remote_archive(), self.command_timeout)
                    .await;
            log_removal(reporter, &cleanup::remove_file_command(plan.remote_archive()), &partial);
            if let Err(e) = partial {
                reporter.warn(Some(kind), e.to_string());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        match &result {
            Ok(()) => reporter.info(Some(kind), "Remote working area cleaned up"),
            Err(e) => reporter.error(Some(kind), e.to_string()),
        }
        reporter.emit(BackupEvent::StepFinished {
            step: kind,
            success: result.is_ok(),
        });
        result
    }
}

fn log_exit(reporter: &mut Reporter, step: StepKind, command: &str, exit_code: i32) {
    let level = if exit_code == 0 {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    reporter.log(
        level,
        Some(step),
        format!("`{command}` exited with status {exit_code}"),
    );
}

/// Refused paths and dropped sessions never ran a command, so they get no status line.
fn log_removal(reporter: &mut Reporter, command: &str, result: &Result<(), StepExecutionError>) {
    match result {
        Ok(()) => log_exit(reporter, StepKind::Cleanup, command, 0),
        Err(StepExecutionError {
            cause: StepFailure::NonZeroExit { command, exit_code, .. },
            ..
        }) => log_exit(reporter, StepKind::Cleanup, command, *exit_code),
        Err(_) => {}
    }
}
