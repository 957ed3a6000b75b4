//! LmRunner — subprocess wrapper for `claude -p` invocations.
//!
//! All language-model calls go through here. The child is spawned with an
//! argument vector (never through a shell), stdout and stderr are drained by
//! concurrent readers so neither pipe can fill and deadlock, and every exit
//! path reaps the child. On timeout the child gets a terminate, a short
//! grace period, then a kill. Rate-limit signals trigger exponential
//! backoff.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const OBSERVE_TOOLS: &str = "Read,Glob,Grep,Bash";
pub const PLAN_TOOLS: &str = "Read,Glob,Grep,Bash";
pub const EXECUTE_TOOLS: &str = "Read,Glob,Grep,Edit,Write,Bash";
pub const META_TOOLS: &str = "Read,Glob,Grep,Bash";
pub const SCOUT_TOOLS: &str = "Read,WebFetch,Bash";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);
const KILL_GRACE: Duration = Duration::from_secs(5);
const RATE_LIMIT_BASE_WAIT: Duration = Duration::from_secs(30);
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

const RATE_LIMIT_SIGNALS: &[&str] = &["rate limit", "429", "too many requests", "overloaded"];

pub fn is_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_SIGNALS.iter().any(|sig| lower.contains(sig))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    MaxTurns,
    Timeout,
    RateLimited,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LmResult {
    pub output: String,
    pub stderr: String,
    pub exit_code: i32,
    pub turns: u32,
    pub success: bool,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Clone)]
pub struct LmRequest {
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    pub allowed_tools: &'static str,
    pub cwd: PathBuf,
}

pub struct LmRunner {
    timeout: Duration,
    cancel: CancellationToken,
}

struct StreamOutcome {
    output: String,
    turns: u32,
    result_errored: bool,
}

impl LmRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            cancel,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one LM invocation, retrying with exponential backoff when the
    /// CLI reports rate limiting (30s → 60s → 120s).
    pub async fn run(&self, request: &LmRequest) -> Result<LmResult> {
        let mut attempt = 0;
        loop {
            let result = self.run_once(request).await?;
            if result.exit_reason == ExitReason::RateLimited && attempt < MAX_RATE_LIMIT_RETRIES {
                let delay = RATE_LIMIT_BASE_WAIT * 2u32.pow(attempt);
                attempt += 1;
                warn!(
                    attempt,
                    delay_s = delay.as_secs(),
                    "claude rate limited, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = self.cancel.cancelled() => {
                        return Ok(LmResult { exit_reason: ExitReason::Cancelled, ..result });
                    }
                }
            }
            return Ok(result);
        }
    }

    async fn run_once(&self, request: &LmRequest) -> Result<LmResult> {
        let started = Instant::now();
        info!(
            model = %request.model,
            max_turns = request.max_turns,
            cwd = %request.cwd.display(),
            "claude -p starting"
        );

        let mut child = Command::new("claude")
            .arg("-p")
            .arg(&request.prompt)
            .args(["--model", &request.model])
            .args(["--output-format", "stream-json", "--verbose"])
            .args(["--max-turns", &request.max_turns.to_string()])
            .args(["--allowedTools", request.allowed_tools])
            .arg("--no-session-persistence")
            .args(["--setting-sources", "user"])
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::LmUnavailable("claude command not found — is Claude Code installed?".into())
                }
                _ => Error::Lm(format!("spawn failed: {e}")),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Lm("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Lm("child stderr not captured".into()))?;

        // Both pipes drain concurrently so neither can fill and block the
        // child.
        let stdout_task = tokio::spawn(read_stream_events(stdout, started));
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut exit_reason = ExitReason::Completed;
        let exit_code: i32;

        tokio::select! {
            status = child.wait() => {
                exit_code = status?.code().unwrap_or(-1);
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(timeout_s = self.timeout.as_secs(), "claude timed out, terminating");
                terminate_then_kill(&mut child).await;
                exit_reason = ExitReason::Timeout;
                exit_code = -1;
            }
            _ = self.cancel.cancelled() => {
                info!("claude invocation cancelled, killing child");
                let _ = child.kill().await;
                let _ = child.wait().await;
                exit_reason = ExitReason::Cancelled;
                exit_code = -1;
            }
        }

        let stream = stdout_task
            .await
            .map_err(|e| Error::Lm(format!("stdout reader: {e}")))?;
        let stderr_text = stderr_task
            .await
            .map_err(|e| Error::Lm(format!("stderr reader: {e}")))?
            .trim()
            .to_string();

        let elapsed = started.elapsed().as_secs_f64();
        let mut output = stream.output.trim().to_string();

        if exit_reason == ExitReason::Completed {
            if is_rate_limit(&stderr_text) {
                exit_reason = ExitReason::RateLimited;
            } else if output.starts_with("Error: Reached max turns") {
                warn!("claude hit the max-turns limit");
                exit_reason = ExitReason::MaxTurns;
                output.clear();
            }
        }

        if exit_code != 0 && output.is_empty() && exit_reason == ExitReason::Completed {
            warn!(
                exit_code,
                elapsed_s = format!("{elapsed:.1}"),
                stderr = %truncate(&stderr_text, 500),
                "claude exited non-zero with no output"
            );
        } else if exit_reason == ExitReason::Completed {
            info!(
                turns = stream.turns,
                elapsed_s = format!("{elapsed:.1}"),
                output_chars = output.len(),
                "claude completed"
            );
        }

        let success = exit_reason == ExitReason::Completed
            && exit_code == 0
            && !output.is_empty()
            && !stream.result_errored;

        Ok(LmResult {
            output,
            stderr: stderr_text,
            exit_code,
            turns: stream.turns,
            success,
            exit_reason,
        })
    }
}

/// Parse the newline-delimited stream-json events, logging each assistant
/// turn as it arrives. Returns the final result text and turn count.
async fn read_stream_events(
    stdout: tokio::process::ChildStdout,
    started: Instant,
) -> StreamOutcome {
    let mut lines = BufReader::new(stdout).lines();
    let mut outcome = StreamOutcome {
        output: String::new(),
        turns: 0,
        result_errored: false,
    };

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => {
                outcome.turns += 1;
                let tools: Vec<&str> = event
                    .pointer("/message/content")
                    .and_then(|c| c.as_array())
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
                            .filter_map(|b| b.get("name").and_then(|n| n.as_str()))
                            .collect()
                    })
                    .unwrap_or_default();
                let elapsed = started.elapsed().as_secs_f64();
                if tools.is_empty() {
                    info!(turn = outcome.turns, elapsed_s = format!("{elapsed:.1}"), "responding");
                } else {
                    info!(
                        turn = outcome.turns,
                        elapsed_s = format!("{elapsed:.1}"),
                        tools = tools.join(", "),
                        "tool use"
                    );
                }
            }
            Some("result") => {
                if let Some(text) = event.get("result").and_then(|r| r.as_str()) {
                    outcome.output = text.to_string();
                }
                if let Some(turns) = event.get("num_turns").and_then(|n| n.as_u64()) {
                    outcome.turns = turns as u32;
                }
                let is_error = event
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false);
                let subtype = event.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                if is_error || (!subtype.is_empty() && subtype != "success") {
                    outcome.result_errored = true;
                    warn!(subtype, "claude result reported an error");
                }
            }
            _ => {}
        }
    }

    outcome
}

/// Terminate, grant a short grace period, then kill. The child is always
/// reaped before returning.
async fn terminate_then_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        if let Some(process) = system.process(Pid::from_u32(pid)) {
            process.kill_with(Signal::Term);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_signals_detected() {
        assert!(is_rate_limit("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit("the api is Overloaded right now"));
        assert!(is_rate_limit("you hit a rate limit"));
        assert!(!is_rate_limit("permission denied"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 2), "he");
        // multi-byte characters are never split
        assert_eq!(truncate("héllo", 2), "hé");
    }

    #[tokio::test]
    async fn stream_events_extract_result_and_turns() {
        // Feed a canned stream through a duplex pipe shaped like stream-json
        let events = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\"}\n",
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Read\"}]}}\n",
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"done\"}]}}\n",
            "{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"final text\",\"num_turns\":2}\n",
        );
        // read_stream_events takes a ChildStdout, so exercise the parsing
        // through a real child process that cats the canned events.
        let mut child = Command::new("printf")
            .arg("%s")
            .arg(events)
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn printf");
        let stdout = child.stdout.take().expect("stdout piped");
        let outcome = read_stream_events(stdout, Instant::now()).await;
        let _ = child.wait().await;
        assert_eq!(outcome.output, "final text");
        assert_eq!(outcome.turns, 2);
        assert!(!outcome.result_errored);
    }
}
