// Process launch contract and the forked-process implementation

use crate::errors::ExecutionError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};
use uuid::Uuid;

pub const ENV_CORRELATION_ID: &str = "JOBRUN_CORRELATION_ID";
pub const ENV_BACKCHANNEL_URL: &str = "JOBRUN_BACKCHANNEL_URL";
pub const ENV_WORKDIR: &str = "JOBRUN_WORKDIR";

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Everything a launcher needs to start the child for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub job_run_id: i64,
    pub correlation_id: Uuid,
    pub backchannel_url: String,
    pub workdir: PathBuf,
}

/// Starts the OS process for a job run
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn ChildProcess>, ExecutionError>;
}

/// Handle on a launched child
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if the platform reports one
    fn id(&self) -> Option<u32>;

    /// Wait for exit; a child terminated by a signal reports `-1`
    async fn wait(&mut self) -> Result<i32, ExecutionError>;

    /// Ask the OS to kill the child without waiting for it
    fn start_kill(&mut self) -> Result<(), ExecutionError>;
}

/// Runs `<runner> --correlation-id <uuid> --backchannel <url> --workdir <dir>`
#[derive(Debug, Clone)]
pub struct ForkedProcessLauncher {
    executable: PathBuf,
}

impl ForkedProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

#[async_trait]
impl ProcessLauncher for ForkedProcessLauncher {
    #[instrument(skip(self, request), fields(correlation_id = %request.correlation_id))]
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn ChildProcess>, ExecutionError> {
        let stdout = tokio::fs::File::create(request.workdir.join(STDOUT_LOG))
            .await
            .map_err(|e| ExecutionError::LaunchFailed(format!("stdout log: {}", e)))?
            .into_std()
            .await;
        let stderr = tokio::fs::File::create(request.workdir.join(STDERR_LOG))
            .await
            .map_err(|e| ExecutionError::LaunchFailed(format!("stderr log: {}", e)))?
            .into_std()
            .await;

        let correlation_id = request.correlation_id.to_string();
        let mut command = Command::new(&self.executable);
        command
            .arg("--correlation-id")
            .arg(&correlation_id)
            .arg("--backchannel")
            .arg(&request.backchannel_url)
            .arg("--workdir")
            .arg(&request.workdir)
            .current_dir(&request.workdir)
            .env(ENV_CORRELATION_ID, &correlation_id)
            .env(ENV_BACKCHANNEL_URL, &request.backchannel_url)
            .env(ENV_WORKDIR, &request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = command.spawn().map_err(|e| {
            ExecutionError::LaunchFailed(format!("{}: {}", self.executable.display(), e))
        })?;

        debug!(pid = ?child.id(), executable = %self.executable.display(), "Child process spawned");
        Ok(Box::new(ForkedChild { child }))
    }
}

struct ForkedChild {
    child: Child,
}

#[async_trait]
impl ChildProcess for ForkedChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<i32, ExecutionError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecutionError::Unavailable(format!("wait for child: {}", e)))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn start_kill(&mut self) -> Result<(), ExecutionError> {
        self.child
            .start_kill()
            .map_err(|e| ExecutionError::Unavailable(format!("kill child: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &Path) -> LaunchRequest {
        LaunchRequest {
            job_run_id: 1,
            correlation_id: Uuid::new_v4(),
            backchannel_url: "http://127.0.0.1:1".to_string(),
            workdir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_launch_passes_arguments_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ForkedProcessLauncher::new("echo");
        let request = request(dir.path());

        let mut child = launcher.launch(&request).await.unwrap();
        assert!(child.id().is_some());
        assert_eq!(child.wait().await.unwrap(), 0);

        let stdout = std::fs::read_to_string(dir.path().join(STDOUT_LOG)).unwrap();
        assert!(stdout.contains("--correlation-id"));
        assert!(stdout.contains(&request.correlation_id.to_string()));
        assert!(stdout.contains("--backchannel http://127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ForkedProcessLauncher::new("false");
        let mut child = launcher.launch(&request(dir.path())).await.unwrap();
        assert_eq!(child.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ForkedProcessLauncher::new(dir.path().join("does-not-exist"));
        let err = launcher.launch(&request(dir.path())).await.err().unwrap();
        assert!(matches!(err, ExecutionError::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_missing_run_directory_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ForkedProcessLauncher::new("echo");
        let err = launcher
            .launch(&request(&dir.path().join("gone")))
            .await
            .err()
            .unwrap();
        match err {
            ExecutionError::LaunchFailed(reason) => assert!(reason.starts_with("stdout log")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
