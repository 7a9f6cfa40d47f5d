//! Amplifier resolution sessions.
//!
//! One external `amplifier run` process per (project, issue). The manager
//! enforces single-flight per key, supervises the process from a detached
//! task, and writes the result back to the store as a bot comment.
//!
//! ```text
//!   run() ──reserve key──> spawn process ──> amplifier:started
//!                                │
//!                     supervising task (tokio::spawn)
//!                                │ wait + capture stdout/stderr
//!                                │ interpret output
//!                                │ sync → comment → issue count → commit → push
//!                                v
//!              completed + amplifier:completed | failed + amplifier:failed
//! ```
//!
//! Cancellation only asks the supervising task to send SIGTERM; the task
//! still runs to completion and records whatever the exit produced.

pub mod output;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{AttractorError, Result};
use crate::events::{Broadcaster, Event};
use crate::models::{Comment, Issue, SessionInfo, SessionStatus, SimpleUser};
use crate::store::StoreHandle;

use self::output::SessionOutcome;

/// Settings file the tool reads, relative to the working directory.
pub const SETTINGS_RELATIVE_PATH: &str = ".amplifier/settings.local.yaml";

const DEFAULT_SETTINGS_YAML: &str = "\
config:
  providers:
  - module: provider-anthropic
    config:
      api_key: ${ANTHROPIC_API_KEY}
      base_url: https://api.anthropic.com
      default_model: claude-opus-4-6
      enable_prompt_caching: 'true'
      priority: 1
    source: git+https://github.com/microsoft/amplifier-module-provider-anthropic@main
";

/// Program used to run sessions. Arguments are fixed:
/// `run --output-format json <prompt>`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: "amplifier".to_string(),
        }
    }
}

struct Session {
    project: String,
    issue_number: i64,
    status: SessionStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    /// Asks the supervising task to signal the process.
    cancel_tx: Option<mpsc::UnboundedSender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            project: self.project.clone(),
            issue_number: self.issue_number,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }
}

type SessionMap = Arc<Mutex<HashMap<String, Session>>>;

fn lock(sessions: &SessionMap) -> MutexGuard<'_, HashMap<String, Session>> {
    // Records are replaced wholesale, so a poisoned map is still consistent
    sessions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the supervising task recorded once the process was handled.
enum Completion {
    Completed { comment_id: i64 },
    Failed { error: String },
}

/// Everything the supervising task needs, owned.
struct Supervision {
    key: String,
    project: String,
    issue_number: i64,
    store: StoreHandle,
    broadcaster: Arc<Broadcaster>,
    sessions: SessionMap,
}

/// Process-wide session registry, constructed once and shared by `Arc`.
pub struct SessionManager {
    config: SessionConfig,
    sessions: SessionMap,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session_key(project: &str, issue_number: i64) -> String {
        format!("{}#{}", project, issue_number)
    }

    /// `"Issue #<n>: <title>"`, plus a blank line and the body when present.
    pub fn build_prompt(issue: &Issue) -> String {
        let mut prompt = format!("Issue #{}: {}", issue.number, issue.title);
        if let Some(body) = issue.body.as_deref().filter(|b| !b.is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(body);
        }
        prompt
    }

    /// Write the default tool settings unless a settings file already exists.
    pub async fn ensure_settings(working_dir: &Path) -> Result<()> {
        let path = settings_path(working_dir);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AttractorError::io(&path, e))?
        {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AttractorError::io(parent, e))?;
        }
        tokio::fs::write(&path, DEFAULT_SETTINGS_YAML)
            .await
            .map_err(|e| AttractorError::io(&path, e))
    }

    /// Start a session for `issue`.
    ///
    /// Fails with `Conflict` while a session for the same key is running.
    /// Returns once the process is spawned and `amplifier:started` is
    /// broadcast; the outcome arrives later as an event.
    pub async fn run(
        &self,
        project: &str,
        issue: &Issue,
        store: StoreHandle,
        broadcaster: Arc<Broadcaster>,
        working_dir: &Path,
    ) -> Result<()> {
        let issue_number = issue.number;
        let key = Self::session_key(project, issue_number);
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();

        // Check and reserve in one critical section
        let previous;
        {
            let mut sessions = lock(&self.sessions);
            if let Some(existing) = sessions.get(&key)
                && existing.status == SessionStatus::Running
            {
                return Err(AttractorError::Conflict(format!(
                    "Amplifier session already running for {} issue #{}",
                    project, issue_number
                )));
            }
            previous = sessions.insert(
                key.clone(),
                Session {
                    project: project.to_string(),
                    issue_number,
                    status: SessionStatus::Running,
                    started_at: Utc::now(),
                    finished_at: None,
                    error: None,
                    cancel_tx: Some(cancel_tx),
                    task: None,
                },
            );
        }

        let child = match self.spawn(issue, working_dir).await {
            Ok(child) => child,
            Err(e) => {
                // Put back the last finished record, if any
                let mut sessions = lock(&self.sessions);
                match previous {
                    Some(previous) => sessions.insert(key, previous),
                    None => sessions.remove(&key),
                };
                return Err(e);
            }
        };

        tracing::info!(project, issue = issue_number, "amplifier session started");
        broadcaster
            .broadcast(&Event::AmplifierStarted {
                project: project.to_string(),
                issue_number,
            })
            .await;

        let supervision = Supervision {
            key: key.clone(),
            project: project.to_string(),
            issue_number,
            store,
            broadcaster,
            sessions: self.sessions.clone(),
        };
        let task = tokio::spawn(supervise(supervision, child, cancel_rx));

        if let Some(session) = lock(&self.sessions).get_mut(&key) {
            session.task = Some(task);
        }
        Ok(())
    }

    async fn spawn(&self, issue: &Issue, working_dir: &Path) -> Result<Child> {
        Self::ensure_settings(working_dir).await?;
        let prompt = Self::build_prompt(issue);

        Command::new(&self.config.command)
            .args(["run", "--output-format", "json"])
            .arg(&prompt)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AttractorError::SubprocessFailure(format!(
                    "Failed to spawn {}: {}",
                    self.config.command, e
                ))
            })
    }

    /// Ask a running session's process to terminate. Does not wait for it.
    pub fn cancel(&self, project: &str, issue_number: i64) -> bool {
        let sessions = lock(&self.sessions);
        match sessions.get(&Self::session_key(project, issue_number)) {
            Some(session) if session.status == SessionStatus::Running => session
                .cancel_tx
                .as_ref()
                .is_some_and(|tx| tx.send(()).is_ok()),
            _ => false,
        }
    }

    pub fn get_status(&self, project: &str, issue_number: i64) -> Option<SessionInfo> {
        lock(&self.sessions)
            .get(&Self::session_key(project, issue_number))
            .map(Session::info)
    }

    /// Every tracked session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            lock(&self.sessions).values().map(Session::info).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Signal every running process; used on server shutdown.
    pub fn shutdown(&self) -> usize {
        let sessions = lock(&self.sessions);
        sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .filter_map(|s| s.cancel_tx.as_ref())
            .filter(|tx| tx.send(()).is_ok())
            .count()
    }

    /// Handles of supervising tasks that are still attached, for callers that
    /// need to wait for outstanding sessions.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        lock(&self.sessions)
            .values_mut()
            .filter_map(|s| s.task.take())
            .collect()
    }
}

/// Supervising task body. Converts every outcome, including store failures
/// and panics in the write-back, into a terminal state plus an event.
async fn supervise(ctx: Supervision, child: Child, cancel_rx: mpsc::UnboundedReceiver<()>) {
    let write_back = tokio::spawn(complete(
        child,
        cancel_rx,
        ctx.project.clone(),
        ctx.issue_number,
        ctx.store.clone(),
    ));

    let completion = match write_back.await {
        Ok(Ok(completion)) => completion,
        Ok(Err(e)) => Completion::Failed {
            error: e.to_string(),
        },
        Err(join_err) => Completion::Failed {
            error: format!("session task panicked: {}", join_err),
        },
    };

    let finished_at = Utc::now();
    let event = {
        let mut sessions = lock(&ctx.sessions);
        let session = sessions.get_mut(&ctx.key);
        match completion {
            Completion::Completed { comment_id } => {
                if let Some(session) = session {
                    session.status = SessionStatus::Completed;
                    session.finished_at = Some(finished_at);
                    session.cancel_tx = None;
                }
                tracing::info!(
                    project = %ctx.project,
                    issue = ctx.issue_number,
                    comment_id,
                    "amplifier session completed"
                );
                Event::AmplifierCompleted {
                    project: ctx.project.clone(),
                    issue_number: ctx.issue_number,
                    comment_id,
                }
            }
            Completion::Failed { error } => {
                if let Some(session) = session {
                    session.status = SessionStatus::Failed;
                    session.finished_at = Some(finished_at);
                    session.error = Some(error.clone());
                    session.cancel_tx = None;
                }
                tracing::warn!(
                    project = %ctx.project,
                    issue = ctx.issue_number,
                    error = %error,
                    "amplifier session failed"
                );
                Event::AmplifierFailed {
                    project: ctx.project.clone(),
                    issue_number: ctx.issue_number,
                    error,
                }
            }
        }
    };

    ctx.broadcaster.broadcast(&event).await;
}

/// Wait for the process, interpret its output and persist the result comment.
async fn complete(
    mut child: Child,
    mut cancel_rx: mpsc::UnboundedReceiver<()>,
    project: String,
    issue_number: i64,
    store: StoreHandle,
) -> Result<Completion> {
    let stdout = tokio::spawn(drain(child.stdout.take()));
    let stderr = tokio::spawn(drain(child.stderr.take()));

    let status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map_err(|e| {
                    AttractorError::SubprocessFailure(format!("Failed to wait for process: {}", e))
                })?;
            }
            Some(()) = cancel_rx.recv() => {
                if let Some(pid) = child.id() {
                    tracing::info!(project = %project, issue = issue_number, pid, "terminating amplifier session");
                    signal_terminate(pid);
                }
            }
        }
    };

    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();
    let outcome = output::interpret(
        &String::from_utf8_lossy(&stdout),
        &String::from_utf8_lossy(&stderr),
        exit_code(&status),
    );

    let body = outcome.body().to_string();
    let comment_id = store
        .call(move |store| {
            store.sync()?;
            let comment_id = store.next_comment_id()?;
            let now = Utc::now();
            let comment = Comment {
                id: comment_id,
                body,
                user: SimpleUser::bot(),
                created_at: now,
                updated_at: now,
                author_association: "BOT".to_string(),
            };
            store.write_comment(issue_number, &comment)?;

            if let Some(mut issue) = store.read_issue(issue_number)? {
                issue.comments += 1;
                store.write_issue(&issue)?;
            }

            store.commit(&format!("amplifier: result for issue #{}", issue_number))?;
            store.push()?;
            Ok(comment_id)
        })
        .await?;

    Ok(match outcome {
        SessionOutcome::Success { .. } => Completion::Completed { comment_id },
        SessionOutcome::Failure { error } => Completion::Failed { error },
    })
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe
        && let Err(e) = pipe.read_to_end(&mut buf).await
    {
        tracing::warn!(error = %e, "failed to read process output");
    }
    buf
}

/// Exit code, with death by signal `n` reported as `-n`.
#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|signal| -signal))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory we own.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> bool {
    false
}

/// Where [`SessionManager::ensure_settings`] looks for the settings file.
pub fn settings_path(working_dir: &Path) -> PathBuf {
    working_dir.join(SETTINGS_RELATIVE_PATH)
}
