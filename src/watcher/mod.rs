// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-process lifecycle watcher.
//!
//! Each managed process gets exactly one watcher, created at first launch
//! and reused across restarts. The watcher is the only path between
//! OS-level process events and the recovery engine: the per-launch monitor
//! task reports the child's exit status here, and the engine gates,
//! stops, or resets the child through it. During a supervised stop the
//! engine disables events so the deaths it causes itself do not come back
//! around as new failures.

use std::process::ExitStatus;
use std::sync::{Mutex, MutexGuard};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::graph::NodeId;

/// Notification from a watcher into the recovery engine.
#[derive(Debug)]
pub enum WatchNotice {
    /// The child exited on its own (or was killed by someone else).
    Exited { node: NodeId, status: ExitStatus },
    /// Extension point for the liveness watchdog; nothing emits this yet.
    LivenessFailed { node: NodeId },
}

/// OS-level view of one spawned child.
#[derive(Debug)]
struct ChildHandle {
    pid: u32,
    exit_status: Option<ExitStatus>,
    closing: bool,
}

#[derive(Debug)]
struct WatcherState {
    handle: Option<ChildHandle>,
    events_enabled: bool,
}

/// Watches a single managed process across its restarts.
///
/// Callbacks never suspend, so all state sits behind a plain mutex.
#[derive(Debug)]
pub struct ProcessWatcher {
    process_name: String,
    node: NodeId,
    notices: UnboundedSender<WatchNotice>,
    state: Mutex<WatcherState>,
}

impl ProcessWatcher {
    pub fn new(
        process_name: impl Into<String>,
        node: NodeId,
        notices: UnboundedSender<WatchNotice>,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            node,
            notices,
            state: Mutex::new(WatcherState {
                handle: None,
                events_enabled: true,
            }),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Called once the child has been spawned.
    pub fn on_connected(&self, pid: u32) {
        info!(process = %self.process_name, pid, "process launched");
        self.lock().handle = Some(ChildHandle {
            pid,
            exit_status: None,
            closing: false,
        });
    }

    /// Child output callback. Output is already redirected to the logfile
    /// (or discarded) at spawn time, so there is nothing to do here.
    pub fn on_data(&self, _fd: i32, _data: &[u8]) {}

    /// Called by the monitor task when the child exits.
    pub fn on_exited(&self, status: ExitStatus) {
        info!(process = %self.process_name, "process exited");
        let mut state = self.lock();
        let Some(handle) = state.handle.as_mut() else {
            return;
        };
        handle.exit_status = Some(status);

        if state.events_enabled {
            info!(
                process = %self.process_name,
                code = ?status.code(),
                "notifying recovery engine of exit"
            );
            if self
                .notices
                .send(WatchNotice::Exited {
                    node: self.node,
                    status,
                })
                .is_err()
            {
                warn!(
                    process = %self.process_name,
                    "recovery engine is gone, dropping exit notification"
                );
            }
        }
    }

    /// Stop exit notifications from reaching the recovery engine.
    pub fn disable_events(&self) {
        self.lock().events_enabled = false;
    }

    pub fn enable_events(&self) {
        self.lock().events_enabled = true;
    }

    /// Ask the child to stop gracefully. A no-op for a child that was
    /// never launched or has already exited.
    pub fn request_stop(&self) {
        info!(process = %self.process_name, "received request to stop process");
        let state = self.lock();
        if let Some(handle) = state.handle.as_ref() {
            if handle.exit_status.is_none() {
                info!(
                    process = %self.process_name,
                    pid = handle.pid,
                    "sending SIGTERM to request a graceful stop"
                );
                send_signal(&self.process_name, handle.pid, Signal::SIGTERM);
            }
        }
    }

    /// Kill the child unconditionally, then close out the handle.
    pub fn force_stop(&self) {
        info!(process = %self.process_name, "received request to force stop process");
        let mut state = self.lock();
        if let Some(handle) = state.handle.as_ref() {
            if handle.exit_status.is_none() {
                info!(
                    process = %self.process_name,
                    pid = handle.pid,
                    "forcefully terminating"
                );
                send_signal(&self.process_name, handle.pid, Signal::SIGKILL);
            }
        }
        if let Some(handle) = state.handle.as_mut() {
            if !handle.closing {
                info!(process = %self.process_name, "closing handle");
                handle.closing = true;
            }
        }
    }

    /// Forget the previous child and re-enable events ahead of a relaunch.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.handle = None;
        state.events_enabled = true;
    }

    /// True while a handle for a spawned child is held.
    pub fn is_connected(&self) -> bool {
        self.lock().handle.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn send_signal(process: &str, pid: u32, signal: Signal) {
    if let Err(errno) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(process, pid, ?signal, %errno, "failed to signal process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn watcher() -> (ProcessWatcher, UnboundedReceiver<WatchNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProcessWatcher::new("mock", 0, tx), rx)
    }

    fn exit_with_code(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn events_delivered_by_default() {
        let (watcher, mut notices) = watcher();
        watcher.on_connected(4242);
        watcher.on_exited(exit_with_code(0));

        match notices.try_recv().unwrap() {
            WatchNotice::Exited { node, status } => {
                assert_eq!(node, 0);
                assert_eq!(status.code(), Some(0));
            }
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[test]
    fn events_inhibited_when_disabled() {
        let (watcher, mut notices) = watcher();
        watcher.on_connected(4242);
        watcher.disable_events();
        watcher.on_exited(exit_with_code(0));

        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn events_delivered_after_reenabling() {
        let (watcher, mut notices) = watcher();
        watcher.on_connected(4242);
        watcher.disable_events();
        watcher.enable_events();
        watcher.on_exited(exit_with_code(1));

        match notices.try_recv().unwrap() {
            WatchNotice::Exited { status, .. } => assert_eq!(status.code(), Some(1)),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[test]
    fn exit_after_reset_is_dropped() {
        let (watcher, mut notices) = watcher();
        watcher.on_connected(4242);
        watcher.reset();
        watcher.on_exited(exit_with_code(0));

        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn request_stop_before_connect_is_a_noop() {
        let (watcher, mut notices) = watcher();
        watcher.request_stop();

        assert!(!watcher.is_connected());
        assert!(notices.try_recv().is_err());
    }

    #[test]
    fn request_stop_after_exit_sends_no_signal() {
        // The pid is fake; a signal attempt would show up as a logged
        // failure, but the exited guard must skip signalling entirely.
        let (watcher, _notices) = watcher();
        watcher.on_connected(4242);
        watcher.on_exited(exit_with_code(0));
        watcher.request_stop();
    }

    #[test]
    fn force_stop_before_connect_is_a_noop() {
        let (watcher, _notices) = watcher();
        watcher.force_stop();
        assert!(!watcher.is_connected());
    }

    #[test]
    fn force_stop_after_exit_only_closes_handle() {
        let (watcher, _notices) = watcher();
        watcher.on_connected(4242);
        watcher.on_exited(exit_with_code(0));
        watcher.force_stop();
        // Handle survives a close; only reset() clears it.
        assert!(watcher.is_connected());
    }

    #[test]
    fn reset_restores_enabled_events_and_clears_handle() {
        let (watcher, mut notices) = watcher();
        watcher.on_connected(4242);
        watcher.disable_events();
        watcher.reset();

        assert!(!watcher.is_connected());

        // Behavioral check that events are enabled again.
        watcher.on_connected(4242);
        watcher.on_exited(exit_with_code(0));
        assert!(notices.try_recv().is_ok());
    }

    #[test]
    fn on_data_is_a_noop() {
        let (watcher, mut notices) = watcher();
        watcher.on_connected(4242);
        watcher.on_data(1, b"stdout chatter");
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn request_stop_terminates_a_real_child() {
        let (watcher, _notices) = watcher();
        let mut child = tokio::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        watcher.on_connected(child.id().unwrap());

        watcher.request_stop();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn force_stop_kills_a_real_child() {
        let (watcher, _notices) = watcher();
        let mut child = tokio::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        watcher.on_connected(child.id().unwrap());

        watcher.force_stop();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }
}
