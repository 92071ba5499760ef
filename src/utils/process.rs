//! Tracking of spawned subprocesses so a worker can terminate all of them on exit.

use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Registry of every subprocess spawned on behalf of one acquisition.
///
/// Each child is supervised by a small task that either reaps it when it
/// exits or kills it once [`ProcessTracker::terminate_all`] is called.
#[derive(Clone, Default)]
pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    kill_switch: CancellationToken,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    terminations: AtomicUsize,
}

/// A spawned child whose lifetime is owned by a [`ProcessTracker`]
pub struct TrackedChild {
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pid: Option<u32>,
    exit: oneshot::Receiver<io::Result<ExitStatus>>,
}

impl TrackedChild {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the child to exit, or to be killed by its tracker
    pub async fn wait(self) -> io::Result<ExitStatus> {
        self.exit.await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "subprocess supervisor stopped before reporting an exit status",
            ))
        })
    }
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` and register the child for termination
    pub fn spawn(&self, command: &mut Command) -> io::Result<TrackedChild> {
        let mut child = command.kill_on_drop(true).spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = oneshot::channel();
        let kill_switch = self.inner.kill_switch.clone();

        let supervisor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_switch.cancelled() => {
                    tracing::debug!("Terminating subprocess {:?}", pid);
                    match child.kill().await {
                        Ok(()) => child.wait().await,
                        Err(e) => Err(e),
                    }
                }
            };
            let _ = exit_tx.send(status);
        });

        self.inner.spawned.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut supervisors) = self.inner.supervisors.lock() {
            supervisors.retain(|handle| !handle.is_finished());
            supervisors.push(supervisor);
        }

        tracing::debug!("Spawned subprocess {:?}", pid);

        Ok(TrackedChild {
            stdout,
            stderr,
            pid,
            exit: exit_rx,
        })
    }

    /// Kill every subprocess that is still running and wait for them to be reaped.
    ///
    /// Returns how many were still running. Safe to call more than once.
    pub async fn terminate_all(&self) -> usize {
        self.inner.terminations.fetch_add(1, Ordering::SeqCst);
        self.inner.kill_switch.cancel();

        let supervisors = match self.inner.supervisors.lock() {
            Ok(mut supervisors) => std::mem::take(&mut *supervisors),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut terminated = 0;
        for supervisor in supervisors {
            if !supervisor.is_finished() {
                terminated += 1;
            }
            if let Err(e) = supervisor.await {
                tracing::warn!("Subprocess supervisor failed during cleanup: {}", e);
            }
        }

        terminated
    }

    /// Number of subprocesses spawned through this tracker
    pub fn spawned_count(&self) -> usize {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    /// Number of times cleanup has run
    pub fn termination_count(&self) -> usize {
        self.inner.terminations.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_reports_exit_status() {
        let tracker = ProcessTracker::new();
        let child = tracker
            .spawn(Command::new("true").stdout(Stdio::null()))
            .unwrap();

        let status = child.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(tracker.spawned_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_all_kills_running_children() {
        let tracker = ProcessTracker::new();
        let child = tracker.spawn(Command::new("sleep").arg("30")).unwrap();

        let terminated = tokio::time::timeout(Duration::from_secs(5), tracker.terminate_all())
            .await
            .unwrap();
        assert_eq!(terminated, 1);

        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert_eq!(tracker.termination_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_all_with_nothing_spawned() {
        let tracker = ProcessTracker::new();
        assert_eq!(tracker.terminate_all().await, 0);
        assert_eq!(tracker.terminate_all().await, 0);
        assert_eq!(tracker.termination_count(), 2);
    }
}
