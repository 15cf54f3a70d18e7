use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Captured output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run a command to completion with a hard timeout.
///
/// On overrun the process is force-killed and an error is returned; the
/// caller decides whether a timeout is fatal for its step.
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<CmdOutput, Box<dyn std::error::Error + Send + Sync>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let run = async {
        // Drain both pipes while waiting so the child never blocks on a
        // full pipe buffer.
        let io = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut out).await;
            }
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut err).await;
            }
            (out, err)
        };
        let (io, status) = tokio::join!(io, child.wait());
        (io, status)
    };

    match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
        Ok(((out, err), status)) => {
            let status = status?;
            Ok(CmdOutput {
                code: status.code(),
                stdout: String::from_utf8_lossy(&out).to_string(),
                stderr: String::from_utf8_lossy(&err).to_string(),
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            Err(format!("{} timed out after {}s", program, timeout_secs).into())
        }
    }
}

/// Spawn a long-running tool without waiting for it.
///
/// The returned child is not killed on drop; pass it back to
/// [`stop_child`] to terminate it.
pub fn spawn_detached(
    program: &str,
    args: &[&str],
) -> Result<tokio::process::Child, Box<dyn std::error::Error + Send + Sync>> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child)
}

/// Terminate a spawned child, waiting briefly for it to exit.
pub async fn stop_child(mut child: tokio::process::Child) {
    let _ = child.start_kill();
    let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_with_timeout("sh", &["-c", "echo hello"], 10)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn overrun_is_killed_and_reported() {
        let err = run_with_timeout("sh", &["-c", "sleep 30"], 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        assert!(run_with_timeout("glasslab-no-such-tool", &[], 5).await.is_err());
    }
}
