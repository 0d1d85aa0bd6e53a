//! Live Vault process ownership and exit notification.
//!
//! A [`ProcessHandle`] is backed by a single watcher task. That task spawns
//! the child, forwards its output, and waits for it to exit. The exit outcome
//! is published once through a [`CompletionSignal`]. Kill requests travel to
//! the watcher over a channel, because only the task that waits on the child
//! may touch it.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::command::{OutputSink, VaultCommand};

/// Kill requests carry a reply channel for the `start_kill` result.
type KillRequest = oneshot::Sender<io::Result<()>>;

/// How the monitored process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process ran and terminated with this status.
    Exited(ExitStatus),
    /// The process could not be started at all.
    SpawnFailed(String),
    /// Waiting on the process failed.
    WaitFailed(String),
    /// The watcher went away without reporting an outcome.
    WatcherLost,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "{status}"),
            Self::SpawnFailed(reason) => write!(f, "spawn failed: {reason}"),
            Self::WaitFailed(reason) => write!(f, "wait failed: {reason}"),
            Self::WatcherLost => f.write_str("exit watcher lost"),
        }
    }
}

/// Write side of a [`CompletionSignal`]. Consumed by [`ExitNotifier::notify`].
#[derive(Debug)]
pub struct ExitNotifier(oneshot::Sender<ProcessExit>);

impl ExitNotifier {
    pub fn notify(self, exit: ProcessExit) {
        // The reader may already be gone (handle dropped); nothing to tell then.
        let _ = self.0.send(exit);
    }
}

/// One-shot notification that the process has exited.
///
/// The first observed outcome is cached, so the start race and `stop` both
/// see the same value. Waiting is cancel-safe.
#[derive(Debug)]
pub struct CompletionSignal {
    rx: Option<oneshot::Receiver<ProcessExit>>,
    outcome: Option<ProcessExit>,
}

impl CompletionSignal {
    pub fn channel() -> (ExitNotifier, Self) {
        let (tx, rx) = oneshot::channel();
        (
            ExitNotifier(tx),
            Self {
                rx: Some(rx),
                outcome: None,
            },
        )
    }

    /// Wait until the outcome is available.
    pub async fn wait(&mut self) -> &ProcessExit {
        if let Some(rx) = self.rx.as_mut() {
            let outcome = rx.await.unwrap_or(ProcessExit::WatcherLost);
            self.rx = None;
            return self.outcome.insert(outcome);
        }
        self.outcome.get_or_insert(ProcessExit::WatcherLost)
    }

    /// The outcome, if it has already been published.
    pub fn try_get(&mut self) -> Option<&ProcessExit> {
        if let Some(rx) = self.rx.as_mut() {
            let outcome = match rx.try_recv() {
                Ok(exit) => exit,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => ProcessExit::WatcherLost,
            };
            self.rx = None;
            self.outcome = Some(outcome);
        }
        self.outcome.as_ref()
    }
}

/// A Vault server process and its exit watcher.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    port: u16,
    kill_tx: Option<oneshot::Sender<KillRequest>>,
    exit: CompletionSignal,
}

impl ProcessHandle {
    /// Start `command` on a new watcher task.
    ///
    /// The child is spawned and waited on by that same task. Never split
    /// start and wait across tasks: on some platforms the exit status is
    /// lost when a different task waits. Spawn errors are reported through
    /// the completion signal like any other exit.
    pub fn spawn(command: &VaultCommand) -> Self {
        let (notifier, exit) = CompletionSignal::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let port = command.port();
        // Detached: the watcher reports through `exit` and ends with the child.
        tokio::spawn(watch(command.clone(), kill_rx, notifier));
        Self {
            port,
            kill_tx: Some(kill_tx),
            exit,
        }
    }

    /// A handle whose process accepts kills but never reports an exit.
    #[cfg(test)]
    pub(crate) fn unresponsive(port: u16) -> Self {
        let (notifier, exit) = CompletionSignal::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<KillRequest>();
        tokio::spawn(async move {
            if let Ok(ack) = kill_rx.await {
                let _ = ack.send(Ok(()));
            }
            std::future::pending::<()>().await;
            notifier.notify(ProcessExit::WatcherLost);
        });
        Self {
            port,
            kill_tx: Some(kill_tx),
            exit,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the process to exit.
    pub async fn exited(&mut self) -> &ProcessExit {
        self.exit.wait().await
    }

    /// Exit outcome if the process has already ended.
    pub fn try_exited(&mut self) -> Option<&ProcessExit> {
        self.exit.try_get()
    }

    /// Wait at most `timeout` for the process to exit.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(timeout, self.exit.wait())
            .await
            .ok()
            .cloned()
    }

    /// Send a kill signal.
    ///
    /// A process that has already exited counts as killed. A second call is
    /// a no-op.
    pub async fn kill(&mut self) -> io::Result<()> {
        let Some(kill_tx) = self.kill_tx.take() else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if kill_tx.send(ack_tx).is_err() {
            // Watcher finished: the process is already gone.
            return Ok(());
        }
        match ack_rx.await {
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

async fn watch(
    command: VaultCommand,
    mut kill_rx: oneshot::Receiver<KillRequest>,
    notifier: ExitNotifier,
) {
    let port = command.port();
    let mut child = match command.to_command().spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(port, binary = %command.binary().display(), error = %e, "vault spawn failed");
            notifier.notify(ProcessExit::SpawnFailed(e.to_string()));
            return;
        }
    };
    debug!(port, pid = ?child.id(), "vault process started");

    if command.output_sink() == OutputSink::Tracing {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, port, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, port, "stderr"));
        }
    }

    let status = tokio::select! {
        status = child.wait() => status,
        request = &mut kill_rx => {
            // A dropped handle closes the channel; that is a kill request too.
            let result = child.start_kill();
            if let Err(e) = &result {
                warn!(port, error = %e, "failed to kill vault process");
            }
            if let Ok(ack) = request {
                let _ = ack.send(result);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::Exited(status),
        Err(e) => ProcessExit::WaitFailed(e.to_string()),
    };
    debug!(port, %exit, "vault process exited");
    notifier.notify(exit);
}

/// Forward each output line as a tracing event.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, port: u16, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "testvault::output", port, stream, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(port, stream, error = %e, "output forwarding stopped");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use vault_core::RootToken;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("vault");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn command(binary: &Path) -> VaultCommand {
        VaultCommand::dev(binary, 1, &RootToken::generate())
    }

    #[tokio::test]
    async fn completion_signal_caches_first_value() {
        let (notifier, mut signal) = CompletionSignal::channel();
        assert!(signal.try_get().is_none());

        notifier.notify(ProcessExit::SpawnFailed("nope".into()));
        assert_eq!(
            signal.wait().await,
            &ProcessExit::SpawnFailed("nope".into())
        );
        // Subsequent reads see the same value.
        assert_eq!(
            signal.try_get(),
            Some(&ProcessExit::SpawnFailed("nope".into()))
        );
        assert_eq!(
            signal.wait().await,
            &ProcessExit::SpawnFailed("nope".into())
        );
    }

    #[tokio::test]
    async fn dropped_notifier_reports_watcher_lost() {
        let (notifier, mut signal) = CompletionSignal::channel();
        drop(notifier);
        assert_eq!(signal.wait().await, &ProcessExit::WatcherLost);
    }

    #[tokio::test]
    async fn waiting_survives_cancellation() {
        let (notifier, mut signal) = CompletionSignal::channel();
        let timed_out = tokio::time::timeout(Duration::from_millis(20), signal.wait()).await;
        assert!(timed_out.is_err());

        notifier.notify(ProcessExit::WatcherLost);
        assert_eq!(signal.wait().await, &ProcessExit::WatcherLost);
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_failure() {
        let mut handle = ProcessHandle::spawn(&command(Path::new("/nonexistent/vault-binary")));
        let exit = handle.exited().await.clone();
        assert!(matches!(exit, ProcessExit::SpawnFailed(_)), "got {exit}");
    }

    #[tokio::test]
    async fn exit_status_is_published() {
        let dir = TempDir::new().unwrap();
        let binary = script(dir.path(), "exit 3");
        let mut handle = ProcessHandle::spawn(&command(&binary));

        match handle.exited().await {
            ProcessExit::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected exit: {other}"),
        }
    }

    #[tokio::test]
    async fn kill_terminates_running_process() {
        let dir = TempDir::new().unwrap();
        let binary = script(dir.path(), "exec sleep 30");
        let mut handle = ProcessHandle::spawn(&command(&binary));

        // Still running after a short while.
        assert!(handle.wait_timeout(Duration::from_millis(100)).await.is_none());

        handle.kill().await.unwrap();
        let exit = handle.wait_timeout(Duration::from_secs(5)).await;
        match exit {
            Some(ProcessExit::Exited(status)) => assert!(!status.success()),
            other => panic!("unexpected exit: {other:?}"),
        }
        // Second kill is a no-op.
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn kill_after_exit_is_ok() {
        let dir = TempDir::new().unwrap();
        let binary = script(dir.path(), "exit 0");
        let mut handle = ProcessHandle::spawn(&command(&binary));

        handle.exited().await;
        handle.kill().await.unwrap();
        assert!(handle.try_exited().is_some());
    }

    #[tokio::test]
    async fn dropping_handle_kills_process() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let binary = script(
            dir.path(),
            &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
        );
        let mut handle = ProcessHandle::spawn(&command(&binary));
        assert!(handle.wait_timeout(Duration::from_millis(200)).await.is_none());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        drop(handle);

        // `kill -0` fails once the process is gone and reaped.
        let mut gone = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let alive = std::process::Command::new("kill")
                .args(["-0", &pid])
                .status()
                .unwrap()
                .success();
            if !alive {
                gone = true;
                break;
            }
        }
        assert!(gone, "process {pid} survived its handle");
    }
}
