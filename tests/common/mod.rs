#![allow(dead_code)]

//! An in-memory stand-in for the backup host.
//!
//! It interprets the handful of shell commands the plan builder emits against a
//! fake filesystem and container list, so runs can be checked end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use homebox_backup::error::{ConnectionError, SessionError};
use homebox_backup::remote::{CommandOutput, ConnectParams, ProgressFn, RemoteSession};
use homebox_backup::session::{Connector, Session};

pub const APP_ID: &str = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2";
pub const DB_ID: &str = "d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5";
pub const PROXY_ID: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

#[derive(Debug, Clone)]
pub struct SimContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub mounts: Vec<(String, String)>,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct HostState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    containers: Vec<SimContainer>,
    commands: Vec<String>,
    failures: Vec<(String, CommandOutput)>,
    hooks: Vec<(String, Hook)>,
    archive_size: Option<usize>,
    truncate_download_to: Option<usize>,
    unreadable: BTreeSet<String>,
    disconnected: bool,
}

pub struct SimulatedHost {
    state: Mutex<HostState>,
    gate: Mutex<Option<(String, Arc<Notify>)>>,
}

impl SimulatedHost {
    pub fn empty() -> Self {
        let mut state = HostState::default();
        state.dirs.insert("/".to_string());
        state.dirs.insert("/tmp".to_string());
        Self {
            state: Mutex::new(state),
            gate: Mutex::new(None),
        }
    }

    /// A host running Homebox with its data at /srv/homebox, Postgres and a proxy.
    pub fn homebox() -> Self {
        let host = Self::empty();
        host.add_container(SimContainer {
            id: APP_ID.to_string(),
            name: "homebox".to_string(),
            image: "ghcr.io/hay-kot/homebox:latest".to_string(),
            running: true,
            mounts: vec![("/data".to_string(), "/srv/homebox".to_string())],
        });
        host.add_container(SimContainer {
            id: DB_ID.to_string(),
            name: "postgres-db".to_string(),
            image: "postgres:16".to_string(),
            running: true,
            mounts: vec![("/var/lib/postgresql/data".to_string(), "/srv/pg".to_string())],
        });
        host.add_container(SimContainer {
            id: PROXY_ID.to_string(),
            name: "nginx".to_string(),
            image: "nginx:alpine".to_string(),
            running: true,
            mounts: Vec::new(),
        });
        host.add_file("/srv/homebox/attachments/items/photo.jpg", b"jpeg");
        host.add_file("/srv/homebox/attachments/manual.pdf", b"pdf");
        host.add_file("/srv/homebox/config/app.yml", b"mode: production");
        host.add_file("/srv/homebox/homebox.db-wal", b"wal");
        host
    }

    pub fn add_container(&self, container: SimContainer) {
        self.state.lock().unwrap().containers.push(container);
    }

    pub fn stop_container(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        for c in state.containers.iter_mut().filter(|c| c.name == name) {
            c.running = false;
        }
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            state.dirs.insert(current.clone());
        }
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        if let Some(parent) = parent_of(path) {
            self.add_dir(&parent);
        }
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.to_vec());
    }

    pub fn remove_tree(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        remove_tree(&mut state, path);
    }

    /// Any command containing `pattern` returns `exit_code` without side effects.
    pub fn fail_on(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.state.lock().unwrap().failures.push((
            pattern.to_string(),
            CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        ));
    }

    /// `cp` refuses to read `path`, as if its permissions denied the backup user.
    pub fn make_unreadable(&self, path: &str) {
        self.state.lock().unwrap().unreadable.insert(path.to_string());
    }

    /// Runs `hook` after a command containing `pattern` has completed.
    pub fn on_command(&self, pattern: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.state
            .lock()
            .unwrap()
            .hooks
            .push((pattern.to_string(), Arc::new(hook)));
    }

    /// The next command containing `pattern` blocks until the returned notify is signalled.
    pub fn gate(&self, pattern: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((pattern.to_string(), notify.clone()));
        notify
    }

    /// Pads every archive `tar` writes to exactly `size` bytes.
    pub fn set_archive_size(&self, size: usize) {
        self.state.lock().unwrap().archive_size = Some(size);
    }

    /// Downloads stop after `size` bytes but still report success.
    pub fn truncate_downloads_to(&self, size: usize) {
        self.state.lock().unwrap().truncate_download_to = Some(size);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Every directory and file at or below `path`.
    pub fn paths_under(&self, path: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let prefix = format!("{path}/");
        state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().unwrap().disconnected
    }

    fn interpret(&self, command: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        if let Some((_, output)) = state.failures.iter().find(|(p, _)| command.contains(p.as_str())) {
            return output.clone();
        }

        let words = shell_words(command);
        let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");

        match (word(0), word(1)) {
            ("docker", "ps") => {
                let stdout = state
                    .containers
                    .iter()
                    .filter(|c| c.running)
                    .map(|c| format!("{}|{}|{}\n", &c.id[..12], c.name, c.image))
                    .collect();
                ok(stdout)
            }
            ("docker", "inspect") => {
                let mut stdout = String::new();
                for id in &words[4..] {
                    let Some(c) = state.containers.iter().find(|c| c.id.starts_with(id.as_str())) else {
                        return exit(1, &format!("Error: No such object: {id}"));
                    };
                    let mounts: Vec<String> = c
                        .mounts
                        .iter()
                        .map(|(inside, host)| {
                            format!("{{\"Type\":\"bind\",\"Source\":\"{host}\",\"Destination\":\"{inside}\"}}")
                        })
                        .collect();
                    stdout.push_str(&format!("{}|[{}]\n", c.id, mounts.join(",")));
                }
                ok(stdout)
            }
            ("test", _) => {
                let id = word(5);
                let running = state
                    .containers
                    .iter()
                    .any(|c| c.id.starts_with(id) && c.running);
                if running {
                    ok(String::new())
                } else {
                    // the `|| { echo MESSAGE >&2; exit 1; }` tail
                    let message = words
                        .iter()
                        .position(|w| w == "echo")
                        .and_then(|i| words.get(i + 1))
                        .map(String::as_str)
                        .unwrap_or("");
                    exit(1, message)
                }
            }
            ("mkdir", _) => {
                for path in &words[1..] {
                    if state.dirs.contains(path) || state.files.contains_key(path) {
                        return exit(1, &format!("mkdir: cannot create directory '{path}': File exists"));
                    }
                    let parent_ok = parent_of(path).is_some_and(|p| state.dirs.contains(&p));
                    if !parent_ok {
                        return exit(1, &format!("mkdir: cannot create directory '{path}': No such file or directory"));
                    }
                    state.dirs.insert(path.clone());
                }
                ok(String::new())
            }
            ("docker", "exec") => {
                let db_name = word(6);
                let target = word(8);
                let parent_ok = parent_of(target).is_some_and(|p| state.dirs.contains(&p));
                if word(3) != "pg_dump" || !parent_ok {
                    return exit(1, "sh: cannot create dump file");
                }
                state
                    .files
                    .insert(target.to_string(), format!("-- PostgreSQL dump of {db_name}\n").into_bytes());
                ok(String::new())
            }
            ("if", _) => {
                let source = word(3).to_string();
                let target = word(9).trim_end_matches(';').trim_end_matches('/').to_string();
                if state.dirs.contains(&source) {
                    copy_contents(&mut state, &source, &target);
                    ok(String::new())
                } else {
                    ok(format!("no media directory at {source}, skipping\n"))
                }
            }
            ("find", _) => {
                let source = word(1).to_string();
                let excluded = word(8).to_string();
                let target = word(13).to_string();
                let batched = word(15) == "+";
                let prefix = format!("{source}/");
                let entries: BTreeSet<String> = state
                    .dirs
                    .iter()
                    .chain(state.files.keys())
                    .filter_map(|p| p.strip_prefix(&prefix))
                    .filter_map(|rest| rest.split('/').next())
                    .filter(|name| *name != excluded)
                    .map(str::to_string)
                    .collect();
                let mut errors = String::new();
                for entry in entries {
                    let path = format!("{source}/{entry}");
                    let nested = format!("{path}/");
                    for denied in state.unreadable.iter().filter(|u| **u == path || u.starts_with(&nested)) {
                        errors.push_str(&format!("cp: cannot open '{denied}' for reading: Permission denied\n"));
                    }
                    copy_tree(&mut state, &path, &format!("{target}/{entry}"));
                }
                // with `-exec ... \;` find ignores the status of each cp
                if errors.is_empty() || !batched {
                    ok(String::new())
                } else {
                    exit(1, &errors)
                }
            }
            ("tar", "-czf") => {
                let archive = word(2).to_string();
                let root = word(4).to_string();
                let mut listing = String::new();
                for member in &words[5..] {
                    let base = format!("{root}/{member}");
                    if !state.dirs.contains(&base) {
                        return exit(2, &format!("tar: {member}: Cannot stat: No such file or directory"));
                    }
                    let prefix = format!("{root}/");
                    let mut entries: Vec<&String> = state
                        .dirs
                        .iter()
                        .chain(state.files.keys())
                        .filter(|p| *p == &base || p.starts_with(&format!("{base}/")))
                        .collect();
                    entries.sort();
                    for entry in entries {
                        listing.push_str(entry.strip_prefix(&prefix).unwrap_or(entry));
                        listing.push('\n');
                    }
                }
                let mut bytes = listing.into_bytes();
                if let Some(size) = state.archive_size {
                    bytes.resize(size, 0);
                }
                state.files.insert(archive, bytes);
                ok(String::new())
            }
            ("stat", _) => match state.files.get(word(3)) {
                Some(bytes) => ok(format!("{}\n", bytes.len())),
                None => exit(
                    1,
                    &format!("stat: cannot statx '{}': No such file or directory", word(3)),
                ),
            },
            ("rm", "-rf") => {
                let path = word(2).to_string();
                remove_tree(&mut state, &path);
                ok(String::new())
            }
            ("rm", "-f") => {
                state.files.remove(word(2));
                ok(String::new())
            }
            _ => exit(127, &format!("sh: {}: command not found", word(0))),
        }
    }

    fn run_hooks(&self, command: &str) {
        let hooks: Vec<Hook> = self
            .state
            .lock()
            .unwrap()
            .hooks
            .iter()
            .filter(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook();
        }
    }
}

#[async_trait]
impl RemoteSession for SimulatedHost {
    fn target(&self) -> String {
        "backup@sim.local:22".to_string()
    }

    async fn execute(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, SessionError> {
        if self.is_disconnected() {
            return Err(SessionError::Closed { target: self.target() });
        }

        let gate = {
            let mut gate = self.gate.lock().unwrap();
            match gate.as_ref() {
                Some((pattern, _)) if command.contains(pattern.as_str()) => gate.take(),
                _ => None,
            }
        };
        if let Some((_, notify)) = gate {
            notify.notified().await;
        }

        let output = self.interpret(command);
        self.run_hooks(command);
        Ok(output)
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<u64, SessionError> {
        let bytes = std::fs::read(local_path).map_err(|e| SessionError::io("read local file", e))?;
        let len = bytes.len() as u64;
        self.add_file(remote_path, &bytes);
        if let Some(progress) = progress {
            progress(len);
        }
        Ok(len)
    }

    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<u64, SessionError> {
        let (mut bytes, truncate) = {
            let state = self.state.lock().unwrap();
            if state.disconnected {
                return Err(SessionError::Closed { target: self.target() });
            }
            let bytes = state.files.get(remote_path).cloned().ok_or_else(|| SessionError::TransferFailed {
                path: remote_path.to_string(),
                exit_code: 1,
                stderr: "No such file or directory".to_string(),
            })?;
            (bytes, state.truncate_download_to)
        };
        if let Some(size) = truncate {
            bytes.truncate(size);
        }

        std::fs::write(local_path, &bytes).map_err(|e| SessionError::io("write local file", e))?;
        let mut sent = 0u64;
        for chunk in bytes.chunks(64 * 1024) {
            sent += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(sent);
            }
        }
        Ok(sent)
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.state.lock().unwrap().disconnected = true;
        Ok(())
    }
}

/// Hands out sessions to one simulated host.
pub struct SimConnector {
    pub host: Arc<SimulatedHost>,
    pub reject_auth: bool,
}

impl SimConnector {
    pub fn new(host: Arc<SimulatedHost>) -> Self {
        Self {
            host,
            reject_auth: false,
        }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Session, ConnectionError> {
        if self.reject_auth {
            return Err(ConnectionError::Auth {
                host: params.host.clone(),
                username: params.username.clone(),
                detail: "Permission denied (publickey).".to_string(),
            });
        }
        self.host.state.lock().unwrap().disconnected = false;
        Ok(Session::new(self.host.clone()))
    }
}

pub fn session(host: &Arc<SimulatedHost>) -> Session {
    Session::new(host.clone())
}

/// Reads the entry listing the simulated `tar` writes.
pub fn archive_entries(bytes: &[u8]) -> Vec<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .lines()
        .map(str::to_string)
        .collect()
}

/// Top-level directories in an archive listing.
pub fn archive_roots(bytes: &[u8]) -> BTreeSet<String> {
    archive_entries(bytes)
        .iter()
        .filter_map(|e| e.split('/').next())
        .map(str::to_string)
        .collect()
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout,
        stderr: String::new(),
    }
}

fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let index = trimmed.rfind('/')?;
    Some(if index == 0 { "/".to_string() } else { trimmed[..index].to_string() })
}

fn remove_tree(state: &mut HostState, path: &str) {
    let prefix = format!("{path}/");
    state.dirs.retain(|d| d != path && !d.starts_with(&prefix));
    state.files.retain(|f, _| f != path && !f.starts_with(&prefix));
}

/// `cp -a source/. target/`
fn copy_contents(state: &mut HostState, source: &str, target: &str) {
    let prefix = format!("{source}/");
    let dirs: Vec<String> = state
        .dirs
        .iter()
        .filter_map(|d| d.strip_prefix(&prefix).map(|rest| format!("{target}/{rest}")))
        .collect();
    let files: Vec<(String, Vec<u8>)> = state
        .files
        .iter()
        .filter_map(|(f, bytes)| {
            f.strip_prefix(&prefix)
                .map(|rest| (format!("{target}/{rest}"), bytes.clone()))
        })
        .collect();
    state.dirs.extend(dirs);
    state.files.extend(files);
}

/// `cp -a source target`
fn copy_tree(state: &mut HostState, source: &str, target: &str) {
    if state.dirs.contains(source) {
        state.dirs.insert(target.to_string());
        copy_contents(state, source, target);
    } else if let Some(bytes) = state.files.get(source).cloned() {
        state.files.insert(target.to_string(), bytes);
    }
}

/// Splits a command line on whitespace, honouring single quotes and backslash escapes.
fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut has_word = false;
    let mut in_quotes = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            '\\' if !in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                    has_word = true;
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        words.push(current);
    }
    words
}
