//! Host-shell agent serving an in-memory queue, used by `strata run`.
//!
//! Scripts run with `sh -c` in the command's working directory. A step
//! exports variables by appending `KEY=value` lines to the file named by
//! `$STRATA_OUTPUT`; only keys matching the command's env filters are
//! reported back.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use strata_core::cmd::{Command, ShellCommand, StepResult};
use strata_core::ids::CmdId;
use strata_core::job::StepStatus;
use strata_core::variables::VariableMap;
use strata_scheduler::memory::InMemoryQueueService;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const ENV_OUTPUT: &str = "STRATA_OUTPUT";

const POLL: Duration = Duration::from_millis(50);

pub struct LocalAgent {
    queues: Arc<InMemoryQueueService>,
    queue: String,
}

/// The step currently executing and the switch that kills it.
struct Running {
    cmd_id: CmdId,
    kill: oneshot::Sender<()>,
}

impl LocalAgent {
    pub fn new(queues: Arc<InMemoryQueueService>, queue: impl Into<String>) -> Self {
        Self {
            queues,
            queue: queue.into(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut running: Option<Running> = None;

        loop {
            let Some(command) = self.queues.next_command(&self.queue, POLL).await else {
                continue;
            };

            match command {
                Command::Shell(shell) => {
                    let (kill, killed) = oneshot::channel();
                    running = Some(Running {
                        cmd_id: shell.id.clone(),
                        kill,
                    });

                    let queues = self.queues.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            queues.report(StepResult::new(shell.id.clone(), StepStatus::Running))
                        {
                            warn!(error = %e, "Failed to acknowledge step");
                        }
                        let result = execute(&shell, killed).await;
                        if let Err(e) = queues.report(result) {
                            warn!(error = %e, "Failed to report step result");
                        }
                    });
                }
                Command::Kill(kill) => {
                    let target = kill.cmd_id.clone();
                    let delivered = match running.take() {
                        Some(current) if target.as_ref().is_none_or(|id| *id == current.cmd_id) => {
                            current.kill.send(()).is_ok()
                        }
                        other => {
                            running = other;
                            false
                        }
                    };

                    // Nothing left to kill: acknowledge directly.
                    if !delivered && let Some(cmd_id) = target {
                        let ack = StepResult::new(cmd_id, StepStatus::Killed)
                            .with_error("no running process");
                        if let Err(e) = self.queues.report(ack) {
                            warn!(error = %e, "Failed to acknowledge kill");
                        }
                    }
                }
            }
        }
    }
}

async fn execute(shell: &ShellCommand, mut killed: oneshot::Receiver<()>) -> StepResult {
    let start_at = Utc::now();
    let workdir = PathBuf::from(&shell.working_dir);
    let output_file = workdir.join(format!(".strata_output_{}", shell.id));

    let mut result = match run_scripts(shell, &workdir, &output_file, &mut killed).await {
        Ok(StepOutcome::Exited(0)) => StepResult::new(shell.id.clone(), StepStatus::Success)
            .with_code(0)
            .with_output(read_outputs(&output_file, &shell.env_filters).await),
        Ok(StepOutcome::Exited(code)) => StepResult::new(shell.id.clone(), StepStatus::Failed)
            .with_code(code)
            .with_error(format!("exited with code {}", code)),
        Ok(StepOutcome::Killed) => {
            StepResult::new(shell.id.clone(), StepStatus::Killed).with_error("killed")
        }
        Err(e) => StepResult::new(shell.id.clone(), StepStatus::Failed).with_error(e.to_string()),
    };

    if let Err(e) = tokio::fs::remove_file(&output_file).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(error = %e, "Failed to remove output file");
    }

    result.start_at = Some(start_at);
    result.finish_at = Some(Utc::now());
    result
}

enum StepOutcome {
    Exited(i32),
    Killed,
}

async fn run_scripts(
    shell: &ShellCommand,
    workdir: &Path,
    output_file: &Path,
    killed: &mut oneshot::Receiver<()>,
) -> std::io::Result<StepOutcome> {
    tokio::fs::create_dir_all(workdir).await?;

    for script in &shell.scripts {
        info!(path = %shell.path, workdir = %workdir.display(), "Executing script");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(workdir)
            .envs(shell.environment.iter())
            .env(ENV_OUTPUT, output_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().map(|s| forward(s, shell.path.to_string(), false));
        let stderr = child.stderr.take().map(|s| forward(s, shell.path.to_string(), true));

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = &mut *killed => None,
        };
        let Some(status) = status else {
            warn!(path = %shell.path, "Killing step");
            child.kill().await?;
            return Ok(StepOutcome::Killed);
        };

        for handle in [stdout, stderr].into_iter().flatten() {
            let _ = handle.await;
        }

        let code = status.code().unwrap_or(-1);
        debug!(path = %shell.path, code, "Script finished");
        if code != 0 {
            return Ok(StepOutcome::Exited(code));
        }
    }

    Ok(StepOutcome::Exited(0))
}

fn forward<R>(reader: R, path: String, stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stderr {
                warn!(path = %path, "{}", line);
            } else {
                info!(path = %path, "{}", line);
            }
        }
    })
}

async fn read_outputs(file: &Path, filters: &[String]) -> VariableMap {
    match tokio::fs::read_to_string(file).await {
        Ok(content) => parse_outputs(&content).filter_prefixes(filters),
        Err(_) => VariableMap::new(),
    }
}

/// Parse `KEY=value` lines; later lines win.
pub fn parse_outputs(content: &str) -> VariableMap {
    let mut outputs = VariableMap::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                outputs.insert(key, value.trim());
            }
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ids::JobId;
    use strata_core::node::NodePath;

    fn shell_command(scripts: &[&str], filters: &[&str]) -> ShellCommand {
        let job_id = JobId::new();
        let path = NodePath::parse("flow/step").unwrap();
        let workdir = std::env::temp_dir().join(format!("strata-local-{}", job_id));
        ShellCommand {
            id: CmdId::of(job_id, &path),
            job_id,
            path,
            scripts: scripts.iter().map(|s| s.to_string()).collect(),
            environment: [("GREETING".to_string(), "hello".to_string())]
                .into_iter()
                .collect(),
            working_dir: workdir.to_string_lossy().into_owned(),
            timeout_secs: 60,
            env_filters: filters.iter().map(|s| s.to_string()).collect(),
            plugin: None,
        }
    }

    #[test]
    fn test_parse_outputs() {
        let outputs = parse_outputs("FLOW_A=1\n\n  FLOW_B = two \nnot a pair\n=x\nFLOW_A=3\n");
        assert_eq!(outputs.get("FLOW_A"), Some("3"));
        assert_eq!(outputs.get("FLOW_B"), Some("two"));
        assert_eq!(outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_success_exports_filtered_outputs() {
        let shell = shell_command(
            &[
                "echo \"FLOW_MSG=$GREETING\" >> \"$STRATA_OUTPUT\"",
                "echo OTHER=1 >> \"$STRATA_OUTPUT\"",
            ],
            &["FLOW_"],
        );
        let (_kill, killed) = oneshot::channel();

        let result = execute(&shell, killed).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.code, Some(0));
        assert_eq!(result.output.get("FLOW_MSG"), Some("hello"));
        assert_eq!(result.output.get("OTHER"), None);
        assert!(result.start_at.is_some() && result.finish_at.is_some());
    }

    #[tokio::test]
    async fn test_failing_script_stops_the_step() {
        let shell = shell_command(&["exit 3", "touch never"], &[]);
        let (_kill, killed) = oneshot::channel();

        let result = execute(&shell, killed).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.code, Some(3));
        assert!(!Path::new(&shell.working_dir).join("never").exists());
    }

    #[tokio::test]
    async fn test_kill_interrupts_script() {
        let shell = shell_command(&["sleep 30"], &[]);
        let (kill, killed) = oneshot::channel();

        let running = tokio::spawn(async move { execute(&shell, killed).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        kill.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, StepStatus::Killed);
    }
}
