//! Process handoff primitives.
//!
//! Neither POSIX nor Windows can re-exec in place while keeping sockets
//! warm, so a restart starts a detached copy of the executable and then
//! exits. The brief gap in availability is accepted.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use async_trait::async_trait;

use crate::error::{Result, UpdateError};

/// Starts the replacement process and ends the current one.
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `exe` with `args`, detached from this process. Returns its PID.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Restart`] if the process cannot be started.
    fn spawn_replacement(&self, exe: &Path, args: &[OsString]) -> Result<u32>;

    /// Terminate the current process.
    fn exit(&self, code: i32);
}

/// Graceful stop of whatever is serving requests in this process.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    /// Stop accepting work and drain. Called once, right before handoff.
    async fn shutdown(&self) -> Result<()>;
}

/// Hook for processes with nothing to drain.
pub struct NoopShutdown;

#[async_trait]
impl ShutdownHook for NoopShutdown {
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// `nohup <exe> <args>` in its own process group.
pub struct PosixLauncher;

impl ProcessLauncher for PosixLauncher {
    fn spawn_replacement(&self, exe: &Path, args: &[OsString]) -> Result<u32> {
        let mut command = Command::new("nohup");
        command
            .arg(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = exe.parent() {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command
            .spawn()
            .map_err(|e| UpdateError::Restart(format!("cannot spawn {}: {e}", exe.display())))?;
        tracing::info!(pid = child.id(), exe = %exe.display(), "replacement process started");
        Ok(child.id())
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// `cmd /C start "" <exe> <args>`.
pub struct WindowsLauncher;

impl ProcessLauncher for WindowsLauncher {
    fn spawn_replacement(&self, exe: &Path, args: &[OsString]) -> Result<u32> {
        let child = Command::new("cmd")
            .args(["/C", "start", ""])
            .arg(exe)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| UpdateError::Restart(format!("cannot spawn {}: {e}", exe.display())))?;
        tracing::info!(pid = child.id(), exe = %exe.display(), "replacement process started");
        Ok(child.id())
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Launcher for the platform this binary was built for.
pub fn platform_launcher() -> Box<dyn ProcessLauncher> {
    if cfg!(target_os = "windows") {
        Box::new(WindowsLauncher)
    } else {
        Box::new(PosixLauncher)
    }
}
