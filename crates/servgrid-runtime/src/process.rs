//! OS process handle backed by `tokio::process`.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::console::ConsoleLog;
use crate::error::{RuntimeError, RuntimeResult};
use crate::traits::ServiceProcess;

/// A spawned child process with captured console.
pub struct OsProcess {
    name: String,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl OsProcess {
    /// Spawn `program args..` inside `working_dir`.
    pub fn spawn(
        name: impl Into<String>,
        program: &str,
        args: &[String],
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        console: Arc<ConsoleLog>,
    ) -> RuntimeResult<Self> {
        let name = name.into();
        let mut child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, console.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, console, true));
        }

        let pid = child.id().ok_or(RuntimeError::MissingProcessId)?;
        let stdin = child.stdin.take();
        info!(service = %name, pid, %program, "process started");

        Ok(Self {
            name,
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(stream: R, console: Arc<ConsoleLog>, error_stream: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        console.push(line, error_stream);
    }
}

#[async_trait]
impl ServiceProcess for OsProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    async fn write_line(&self, line: &str) -> RuntimeResult<()> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(RuntimeError::NotRunning)?;
        pipe.write_all(line.as_bytes()).await?;
        pipe.write_all(b"\n").await?;
        pipe.flush().await?;
        Ok(())
    }

    async fn stop(&self, shutdown_commands: &[String], timeout: Duration) {
        for command in shutdown_commands {
            if let Err(e) = self.write_line(command).await {
                debug!(service = %self.name, %command, error = %e, "shutdown command not delivered");
            }
        }
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => info!(service = %self.name, %status, "process exited"),
            Ok(Err(e)) => warn!(service = %self.name, error = %e, "waiting for process failed"),
            Err(_) => {
                warn!(service = %self.name, ?timeout, "process did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    warn!(service = %self.name, error = %e, "kill failed");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn console() -> Arc<ConsoleLog> {
        Arc::new(ConsoleLog::new("test", 16))
    }

    #[tokio::test]
    async fn echoes_written_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = console();
        let mut feed = log.subscribe();
        let process = OsProcess::spawn(
            "cat",
            "cat",
            &[],
            dir.path(),
            &BTreeMap::new(),
            log.clone(),
        )
        .unwrap();

        assert!(process.alive().await);
        assert!(process.pid().is_some_and(|pid| pid > 0));
        process.write_line("hello").await.unwrap();
        let line = feed.recv().await.unwrap();
        assert_eq!(line.line, "hello");

        process.stop(&[], Duration::from_secs(5)).await;
        assert!(!process.alive().await);
        assert!(matches!(
            process.write_line("late").await,
            Err(RuntimeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn graceful_command_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = "while read line; do [ \"$line\" = stop ] && exit 0; done".to_string();
        let process = OsProcess::spawn(
            "sh",
            "sh",
            &["-c".to_string(), script],
            dir.path(),
            &BTreeMap::new(),
            console(),
        )
        .unwrap();

        process
            .stop(&["end".to_string(), "stop".to_string()], Duration::from_secs(5))
            .await;
        assert!(!process.alive().await);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let process = OsProcess::spawn(
            "sleep",
            "sleep",
            &["30".to_string()],
            dir.path(),
            &BTreeMap::new(),
            console(),
        )
        .unwrap();

        process.stop(&[], Duration::from_millis(100)).await;
        assert!(!process.alive().await);
    }

    #[tokio::test]
    async fn runs_in_working_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let log = console();
        let mut env = BTreeMap::new();
        env.insert("SERVGRID_TEST".to_string(), "42".to_string());
        let process = OsProcess::spawn(
            "sh",
            "sh",
            &["-c".to_string(), "pwd; echo $SERVGRID_TEST".to_string()],
            dir.path(),
            &env,
            log.clone(),
        )
        .unwrap();

        process.stop(&[], Duration::from_secs(5)).await;
        // Give the pump task a moment to drain the pipe.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lines = log.lines();
        assert!(lines.iter().any(|l| l == "42"));
    }
}
