// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::fs::OpenOptions;
use std::io;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{error, info};

use crate::graph::LaunchSpec;
use crate::watcher::ProcessWatcher;

/// Spawn one managed process and wire its exit back into the watcher.
///
/// stdout/stderr are appended to the per-process logfile when one is
/// configured and discarded otherwise. A monitor task takes ownership of
/// the child handle and reports the eventual exit status to the watcher;
/// children do not outlive the supervisor.
pub(crate) fn launch_process(spec: &LaunchSpec, watcher: &Arc<ProcessWatcher>) -> io::Result<()> {
    info!(
        process = %spec.name,
        executable = %spec.executable_path.display(),
        arguments = ?spec.arguments,
        "launching process"
    );

    let mut command = Command::new(&spec.executable_path);
    command.args(&spec.arguments);
    command.envs(&spec.environment);
    command.kill_on_drop(true);
    match &spec.logfile {
        Some(logfile) => {
            let log = OpenOptions::new().create(true).append(true).open(logfile)?;
            command.stdout(Stdio::from(log.try_clone()?));
            command.stderr(Stdio::from(log));
        }
        None => {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }
    }

    let mut child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned child has no pid"))?;
    watcher.on_connected(pid);

    let watcher = Arc::clone(watcher);
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => watcher.on_exited(status),
            Err(error) => error!(
                process = %watcher.process_name(),
                %error,
                "failed to await process exit"
            ),
        }
    });

    Ok(())
}
