//! Subprocess helpers shared across the workspace.
//!
//! Every child spawned through these helpers is tied to the lifetime of its
//! handle: dropping the handle kills the process, so a job that is torn down
//! early cannot leak an encoder.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Return `true` when `program` can be spawned and exits successfully with
/// `probe_arg` (for example `ffmpeg -version`).
pub fn is_program_available(program: impl AsRef<OsStr>, probe_arg: &str) -> bool {
    std_command(program)
        .arg(probe_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` whose child is killed when its handle
/// is dropped.
///
/// stdin is piped, stdout is discarded and stderr is piped so callers can
/// stream frames in and collect diagnostics.
#[cfg(feature = "tokio")]
pub fn piped_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    cmd
}

/// Wait up to `grace` for `child` to exit on its own, then kill it.
///
/// Returns the exit status in both cases. A child that was already reaped
/// returns its cached status immediately.
#[cfg(feature = "tokio")]
pub async fn terminate(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            child.start_kill()?;
            child.wait().await
        }
    }
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_program_is_unavailable() {
        assert!(!is_program_available(
            "definitely-not-a-real-program-4f1c",
            "-version"
        ));
    }

    #[tokio::test]
    async fn test_terminate_kills_long_running_child() {
        let mut child = piped_command("sleep").arg("30").spawn().unwrap();

        let status = terminate(&mut child, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_returns_status_of_exited_child() {
        let mut child = piped_command("true").spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = terminate(&mut child, Duration::from_secs(5)).await.unwrap();

        assert!(status.success());
    }
}
