// Command consumer: runs an external program per job
// reason: tokio::process for async child management, nix for graceful SIGTERM
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use eventjobs_core::application::worker::constants::GRACEFUL_SHUTDOWN_TIMEOUT_MS;
use eventjobs_core::domain::Job;
use eventjobs_core::port::{JobConsumer, JobExecutionContext, JobResult};

/// Environment handed to every child besides the allowlisted variables
pub const ENV_JOB_ID: &str = "EVENTJOBS_JOB_ID";
pub const ENV_JOB_TOPIC: &str = "EVENTJOBS_JOB_TOPIC";
pub const ENV_JOB_RETRY_COUNT: &str = "EVENTJOBS_JOB_RETRY_COUNT";
pub const ENV_JOB_PROPERTIES: &str = "EVENTJOBS_JOB_PROPERTIES";

/// Captured output kept in the result message
const OUTPUT_TAIL_BYTES: usize = 2048;

/// How long output readers may run on after the child is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit code meaning "do not retry"
pub const EXIT_CODE_CANCEL: i32 = 75;

fn default_grace_period_ms() -> u64 {
    GRACEFUL_SHUTDOWN_TIMEOUT_MS as u64
}

/// What to run for the bound topics
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandSpec {
    /// Topic patterns the consumer registers for
    pub topics: Vec<String>,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Kill the child after this long (none = unbounded)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Variables inherited from the daemon environment
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    #[serde(default)]
    pub ranking: i32,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            topics: Vec::new(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            timeout_secs: None,
            grace_period_ms: default_grace_period_ms(),
            env_allowlist: Vec::new(),
            ranking: 0,
        }
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Stopped,
}

/// Job consumer that spawns one child process per job
///
/// Exit code 0 succeeds, [`EXIT_CODE_CANCEL`] cancels, anything else fails
/// and is retried by the queue.
pub struct CommandConsumer {
    spec: CommandSpec,
}

impl CommandConsumer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Allowlisted variables of `source`
    fn filter_env(&self, source: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
        source
            .filter(|(k, _)| self.spec.env_allowlist.contains(k))
            .collect()
    }

    fn command(&self, job: &Job) -> Command {
        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .env_clear()
            .envs(self.filter_env(std::env::vars()))
            .env(ENV_JOB_ID, &job.id)
            .env(ENV_JOB_TOPIC, &job.topic)
            .env(ENV_JOB_RETRY_COUNT, job.retry_count.to_string())
            .env(
                ENV_JOB_PROPERTIES,
                serde_json::Value::Object(job.properties.clone()).to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        // Own process group, so termination reaches grandchildren too
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn wait(&self, child: &mut Child, context: &mut JobExecutionContext) -> Outcome {
        let timeout = async {
            match self.spec.timeout_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = timeout => Outcome::TimedOut,
            _ = context.stopped() => Outcome::Stopped,
        }
    }

    /// SIGTERM to the process group first, then SIGKILL after the grace period
    async fn terminate(&self, child: &mut Child) {
        let grace = Duration::from_millis(self.spec.grace_period_ms);

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let group = Pid::from_raw(pid as i32);
                info!(pid = pid, "Sending SIGTERM for graceful shutdown");
                match killpg(group, Signal::SIGTERM) {
                    Ok(()) => {
                        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                            info!(pid = pid, "Process exited gracefully after SIGTERM");
                            // Leftover members of the group
                            let _ = killpg(group, Signal::SIGKILL);
                            return;
                        }
                        warn!(pid = pid, "Process did not exit after SIGTERM, sending SIGKILL");
                    }
                    Err(e) => warn!(pid = pid, error = %e, "SIGTERM failed"),
                }
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    warn!(pid = pid, error = %e, "SIGKILL of process group failed");
                }
            }
        }

        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Unable to kill process");
        }
    }
}

fn collect<R>(reader: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf).await;
        }
        let start = buf.len().saturating_sub(OUTPUT_TAIL_BYTES);
        String::from_utf8_lossy(&buf[start..]).trim().to_string()
    })
}

/// Output of a reader task, given up when a surviving descendant holds the pipe
async fn drain(reader: JoinHandle<String>) -> String {
    let abort = reader.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

#[async_trait]
impl JobConsumer for CommandConsumer {
    async fn process(&self, job: &Job, mut context: JobExecutionContext) -> JobResult {
        let mut child = match self.command(job).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(job_id = %job.id, program = %self.spec.program, error = %e, "Spawn failed");
                context.set_result_message(format!("spawn failed: {}", e));
                return JobResult::Cancelled;
            }
        };
        info!(
            job_id = %job.id,
            topic = %job.topic,
            program = %self.spec.program,
            pid = ?child.id(),
            "Started command"
        );
        let stdout = collect(child.stdout.take());
        let stderr = collect(child.stderr.take());

        let outcome = self.wait(&mut child, &mut context).await;
        if !matches!(outcome, Outcome::Exited(_)) {
            self.terminate(&mut child).await;
        }
        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        match outcome {
            Outcome::Exited(Ok(status)) => {
                info!(job_id = %job.id, exit_code = ?status.code(), "Command finished");
                match status.code() {
                    Some(0) => {
                        if !stdout.is_empty() {
                            context.set_result_message(stdout);
                        }
                        JobResult::Succeeded
                    }
                    Some(EXIT_CODE_CANCEL) => {
                        context.set_result_message(stderr);
                        JobResult::Cancelled
                    }
                    code => {
                        context.set_result_message(match code {
                            Some(code) => format!("exit code {}: {}", code, stderr),
                            None => format!("terminated by signal: {}", stderr),
                        });
                        JobResult::failed()
                    }
                }
            }
            Outcome::Exited(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "Waiting for command failed");
                context.set_result_message(e.to_string());
                JobResult::failed()
            }
            Outcome::TimedOut => {
                warn!(job_id = %job.id, timeout_secs = ?self.spec.timeout_secs, "Command timed out");
                context.set_result_message("timed out");
                JobResult::failed()
            }
            Outcome::Stopped => {
                info!(job_id = %job.id, "Command stopped");
                JobResult::Cancelled
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use eventjobs_core::domain::JobProperties;
    use eventjobs_core::port::AsyncCompletion;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    fn job() -> Job {
        let mut properties = JobProperties::new();
        properties.insert("file".into(), json!("a.txt"));
        Job {
            id: "job-1".into(),
            topic: "build/run".into(),
            name: None,
            path: "/jobs/assigned/local/build.run/job-1".into(),
            queue_name: None,
            created_at: 0,
            created_instance: None,
            target_instance: None,
            retry_count: 2,
            max_retries: 10,
            queued_at: None,
            started_at: None,
            finished_state: None,
            finished_at: None,
            result_message: None,
            properties,
            read_errors: Vec::new(),
        }
    }

    fn context() -> (
        JobExecutionContext,
        watch::Sender<bool>,
        Arc<Mutex<Option<String>>>,
    ) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (completion, _rx) = AsyncCompletion::channel();
        let message = Arc::new(Mutex::new(None));
        (
            JobExecutionContext::new(stop_rx, completion, message.clone()),
            stop_tx,
            message,
        )
    }

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new(program, args);
        spec.env_allowlist = vec!["PATH".to_string()];
        spec
    }

    fn shell(script: &str) -> CommandConsumer {
        CommandConsumer::new(spec("sh", &["-c", script]))
    }

    #[tokio::test]
    async fn test_success_keeps_stdout() {
        let (ctx, _stop, message) = context();
        let result = shell("echo hello").process(&job(), ctx).await;
        assert_eq!(result, JobResult::Succeeded);
        assert_eq!(message.lock().unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_job_is_passed_through_env() {
        let (ctx, _stop, _) = context();
        let script = format!(
            "test \"${}\" = job-1 && test \"${}\" = build/run && test \"${}\" = 2 \
             && echo \"${}\" | grep -q a.txt",
            ENV_JOB_ID, ENV_JOB_TOPIC, ENV_JOB_RETRY_COUNT, ENV_JOB_PROPERTIES
        );
        let result = CommandConsumer::new(spec("sh", &["-c", &script]))
            .process(&job(), ctx)
            .await;
        assert_eq!(result, JobResult::Succeeded);
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let (ctx, _stop, message) = context();
        let result = shell("echo broken >&2; exit 3").process(&job(), ctx).await;
        assert_eq!(result, JobResult::failed());
        assert_eq!(
            message.lock().unwrap().as_deref(),
            Some("exit code 3: broken")
        );

        let (ctx, _stop, _) = context();
        let result = shell("exit 75").process(&job(), ctx).await;
        assert_eq!(result, JobResult::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_program_cancels() {
        let (ctx, _stop, message) = context();
        let consumer = CommandConsumer::new(CommandSpec::new("/nonexistent/program", &[]));
        assert_eq!(consumer.process(&job(), ctx).await, JobResult::Cancelled);
        assert!(message.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let (ctx, _stop, message) = context();
        let mut spec = spec("sleep", &["10"]);
        spec.timeout_secs = Some(0);
        spec.grace_period_ms = 100;
        let result = CommandConsumer::new(spec).process(&job(), ctx).await;
        assert_eq!(result, JobResult::failed());
        assert_eq!(message.lock().unwrap().as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_stop_terminates_child() {
        let (ctx, stop, _) = context();
        let mut spec = spec("sleep", &["10"]);
        spec.grace_period_ms = 1000;
        let consumer = CommandConsumer::new(spec);

        let started = std::time::Instant::now();
        let job = job();
        let run = consumer.process(&job, ctx);
        let signal = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.send_replace(true);
        };
        let (result, _) = tokio::join!(run, signal);
        assert_eq!(result, JobResult::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_reaches_grandchildren() {
        let (ctx, stop, _) = context();
        let mut spec = spec("sh", &["-c", "sleep 30; echo late"]);
        spec.grace_period_ms = 1000;
        let consumer = CommandConsumer::new(spec);

        let started = std::time::Instant::now();
        let job = job();
        let run = consumer.process(&job, ctx);
        let signal = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.send_replace(true);
        };
        let (result, _) = tokio::join!(run, signal);
        assert_eq!(result, JobResult::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_background_descendant_does_not_hold_the_result() {
        let (ctx, _stop, _) = context();
        let started = std::time::Instant::now();
        let result = shell("sleep 30 & echo started").process(&job(), ctx).await;
        assert_eq!(result, JobResult::Succeeded);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_env_filtering() {
        let mut spec = CommandSpec::new("true", &[]);
        spec.env_allowlist = vec!["ALLOWED_VAR".to_string()];
        let consumer = CommandConsumer::new(spec);

        let env = vec![
            ("ALLOWED_VAR".to_string(), "value1".to_string()),
            ("BLOCKED_VAR".to_string(), "value2".to_string()),
        ];
        let filtered = consumer.filter_env(env.into_iter());

        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("ALLOWED_VAR"));
    }

    #[test]
    fn test_spec_defaults_from_config() {
        let spec: CommandSpec = serde_json::from_value(json!({
            "topics": ["build/*"],
            "program": "make",
        }))
        .unwrap();
        assert_eq!(spec.grace_period_ms, GRACEFUL_SHUTDOWN_TIMEOUT_MS as u64);
        assert!(spec.args.is_empty());
        assert_eq!(spec.timeout_secs, None);
    }
}
