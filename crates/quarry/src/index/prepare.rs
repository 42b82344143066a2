//! Preparation runner: builds a target set with the external build tool.
//!
//! Preparation makes a target's prerequisites available so its source files
//! can be individually indexed. The runner launches
//! `swift build --package-path <ws> --scratch-path <scratch>
//! --disable-index-store --target <id>` per target, relays cancellation as an
//! interrupt signal, and reports the captured output through a result
//! callback. Non-zero exits are not errors: they are almost always
//! compilation errors in user code.

use std::{fmt, path::PathBuf, process::Stdio, sync::Arc};

use quarry_core::ConfiguredTarget;
use tokio::{io::AsyncReadExt, process::Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{buildsystem::BuildParameters, scheduler::TaskPriority};

/// How a build-tool invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareExit {
  Success,
  /// Non-zero exit; likely compilation errors in user code.
  Failed(i32),
  Signalled(i32),
  /// The invocation was interrupted because the task was cancelled.
  Cancelled,
  /// The process could not be launched or terminated abnormally.
  Abnormal,
}

/// Outcome of preparing a single target, delivered to the result callback.
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
  pub target: ConfiguredTarget,
  pub exit: PrepareExit,
  pub stdout: String,
  pub stderr: String,
}

pub type PrepareResultCallback = Arc<dyn Fn(PrepareOutcome) + Send + Sync>;

/// Description of one preparation task: build the given targets, in order.
#[derive(Clone)]
pub struct PrepareTaskDescription {
  pub targets: Vec<ConfiguredTarget>,
  priority: TaskPriority,
  params: BuildParameters,
  workspace_path: PathBuf,
  on_result: Option<PrepareResultCallback>,
}

impl PrepareTaskDescription {
  pub fn new(
    targets: Vec<ConfiguredTarget>,
    priority: TaskPriority,
    params: BuildParameters,
    workspace_path: PathBuf,
    on_result: Option<PrepareResultCallback>,
  ) -> Self {
    Self {
      targets,
      priority,
      params,
      workspace_path,
      on_result,
    }
  }

  pub fn priority(&self) -> TaskPriority {
    self.priority
  }

  /// Same work iff the same target set at the same priority.
  pub fn is_idempotent_with(&self, other: &Self) -> bool {
    self.targets == other.targets
  }

  pub(crate) async fn run(&self, cancel: &CancellationToken) {
    // Sequential per target; the build tool parallelizes internally.
    for target in &self.targets {
      if cancel.is_cancelled() {
        return;
      }
      if target.is_package_manifest() {
        // The manifest has nothing to prepare.
        continue;
      }
      let outcome = self.prepare_target(target, cancel).await;
      if let Some(callback) = &self.on_result {
        callback(outcome);
      }
    }
  }

  async fn prepare_target(&self, target: &ConfiguredTarget, cancel: &CancellationToken) -> PrepareOutcome {
    let mut command = Command::new(self.params.toolchain.swift());
    command
      .arg("build")
      .arg("--package-path")
      .arg(&self.workspace_path)
      .arg("--scratch-path")
      .arg(&self.params.scratch_path)
      .arg("--disable-index-store")
      .arg("--target")
      .arg(&target.target_id)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());

    trace!(%target, "Launching build tool for preparation");
    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(io_error) => {
        error!(%target, error = %io_error, "Failed to launch build tool");
        return PrepareOutcome {
          target: target.clone(),
          exit: PrepareExit::Abnormal,
          stdout: String::new(),
          stderr: io_error.to_string(),
        };
      }
    };

    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let (status, was_cancelled) = tokio::select! {
      status = child.wait() => (status, false),
      _ = cancel.cancelled() => {
        interrupt(&child);
        (child.wait().await, true)
      }
    };

    let stdout = stdout_reader.await.unwrap_or_default();
    let stderr = stderr_reader.await.unwrap_or_default();
    let exit = classify_exit(target, status, was_cancelled);
    PrepareOutcome {
      target: target.clone(),
      exit,
      stdout,
      stderr,
    }
  }
}

impl fmt::Display for PrepareTaskDescription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "preparing ")?;
    for (i, target) in self.targets.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{target}")?;
    }
    Ok(())
  }
}

fn classify_exit(
  target: &ConfiguredTarget,
  status: std::io::Result<std::process::ExitStatus>,
  was_cancelled: bool,
) -> PrepareExit {
  match status {
    Ok(status) => match status.code() {
      Some(0) => {
        debug!(%target, "Preparation succeeded");
        PrepareExit::Success
      }
      Some(code) => {
        debug!(%target, code, "Build tool exited non-zero; probably compilation errors in user code");
        PrepareExit::Failed(code)
      }
      None => {
        let signal = exit_signal(&status);
        if was_cancelled {
          debug!(%target, signal, "Build tool exited by signal after cancellation");
          PrepareExit::Cancelled
        } else {
          error!(%target, signal, "Build tool was killed by a signal");
          PrepareExit::Signalled(signal)
        }
      }
    },
    Err(io_error) => {
      if was_cancelled {
        debug!(%target, error = %io_error, "Build tool wait failed after cancellation");
        PrepareExit::Cancelled
      } else {
        error!(%target, error = %io_error, "Build tool terminated abnormally");
        PrepareExit::Abnormal
      }
    }
  }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> i32 {
  use std::os::unix::process::ExitStatusExt;
  status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> i32 {
  0
}

/// Relay cancellation to a subprocess as an interrupt, giving the build tool
/// a chance to clean up its build database.
#[cfg(unix)]
pub(crate) fn interrupt(child: &tokio::process::Child) {
  if let Some(pid) = child.id() {
    trace!(pid, "Relaying cancellation to subprocess as SIGINT");
    unsafe {
      libc::kill(pid as i32, libc::SIGINT);
    }
  }
}

#[cfg(not(unix))]
pub(crate) fn interrupt(child: &tokio::process::Child) {
  // No interrupt signal to relay; fall back to killing the process.
  let _ = child.start_kill();
}

/// Drain a child pipe to a string in the background.
pub(crate) fn spawn_pipe_reader<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
  R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let Some(mut pipe) = pipe else { return String::new() };
    let mut buffer = Vec::new();
    let _ = pipe.read_to_end(&mut buffer).await;
    String::from_utf8_lossy(&buffer).into_owned()
  })
}
