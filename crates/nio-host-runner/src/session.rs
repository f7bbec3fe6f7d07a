use std::sync::Arc;

use nio_vfs::{StdStream, Vfs, VfsError};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::debug;

use crate::bridge::{self, ExecError, ExecRequest, ExecResult, RunnerConfig};
use crate::config::RunnerLimits;
use crate::image::{ImageCache, LoadError, ProgramImage};

/// What happens to `/dev/stdin` after an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StdinPolicy {
    /// Stdin keeps growing; every instance reads it from the start.
    #[default]
    Accumulate,
    /// Stdin is emptied once an execution finishes.
    ClearAfterExec,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub stdin_policy: StdinPolicy,
    pub env: Vec<(String, String)>,
    pub limits: RunnerLimits,
}

/// Output produced by a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub result: ExecResult,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A long-lived VFS plus the image that runs against it.
///
/// Executions are serialized: [`Session::exec`] waits its turn,
/// [`Session::try_exec`] fails with [`ExecError::Busy`] instead. A run that
/// has started always finishes even if the awaiting future is dropped.
#[derive(Debug, Clone)]
pub struct Session {
    image: ProgramImage,
    vfs: Arc<Mutex<Vfs>>,
    config: Arc<RunnerConfig>,
    stdin_policy: StdinPolicy,
}

impl Session {
    pub fn new(image: ProgramImage, options: SessionOptions) -> Self {
        Self::with_vfs(image, Vfs::new(), options)
    }

    pub fn with_vfs(image: ProgramImage, vfs: Vfs, options: SessionOptions) -> Self {
        Session {
            image,
            vfs: Arc::new(Mutex::new(vfs)),
            config: Arc::new(RunnerConfig {
                env: options.env,
                limits: options.limits,
            }),
            stdin_policy: options.stdin_policy,
        }
    }

    /// Loads the image through `cache` and opens a session with a fresh VFS.
    pub async fn load(cache: &ImageCache, options: SessionOptions) -> Result<Self, LoadError> {
        let image = cache.load().await?;
        Ok(Session::new(image, options))
    }

    pub fn image(&self) -> &ProgramImage {
        &self.image
    }

    pub fn stdin_policy(&self) -> StdinPolicy {
        self.stdin_policy
    }

    pub async fn exec(&self, request: ExecRequest) -> Result<ExecResult, ExecError> {
        Ok(self.exec_capture(request).await?.result)
    }

    pub async fn try_exec(&self, request: ExecRequest) -> Result<ExecResult, ExecError> {
        let guard = Arc::clone(&self.vfs)
            .try_lock_owned()
            .map_err(|_| ExecError::Busy)?;
        Ok(self.dispatch(guard, request).await?.result)
    }

    /// Like [`Session::exec`], also returning what the run appended to
    /// stdout and stderr.
    pub async fn exec_capture(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
        let guard = Arc::clone(&self.vfs).lock_owned().await;
        self.dispatch(guard, request).await
    }

    async fn dispatch(
        &self,
        mut guard: OwnedMutexGuard<Vfs>,
        request: ExecRequest,
    ) -> Result<ExecOutput, ExecError> {
        let image = self.image.clone();
        let config = Arc::clone(&self.config);
        let policy = self.stdin_policy;

        tokio::task::spawn_blocking(move || {
            let stdout_mark = guard.stream_len(StdStream::Stdout);
            let stderr_mark = guard.stream_len(StdStream::Stderr);

            let res = bridge::run(&image, &mut guard, &request, &config);
            if policy == StdinPolicy::ClearAfterExec {
                guard.clear_stream(StdStream::Stdin);
            }
            let result = res?;

            let stdout = tail(guard.stream(StdStream::Stdout), stdout_mark);
            let stderr = tail(guard.stream(StdStream::Stderr), stderr_mark);
            debug!(
                exit_code = result.exit_code,
                stdout_bytes = stdout.len(),
                stderr_bytes = stderr.len(),
                "session exec"
            );
            Ok(ExecOutput {
                result,
                stdout,
                stderr,
            })
        })
        .await
        .map_err(|err| ExecError::Fault {
            trap: format!("exec task failed: {err}"),
        })?
    }

    /// Direct access to the VFS. Executions wait while the guard is held.
    pub async fn vfs(&self) -> MutexGuard<'_, Vfs> {
        self.vfs.lock().await
    }

    pub async fn append_stdin(&self, data: impl AsRef<[u8]>) -> Result<(), VfsError> {
        self.vfs
            .lock()
            .await
            .append(StdStream::Stdin.path(), data)
    }

    pub async fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> Result<(), VfsError> {
        self.vfs.lock().await.write(path, data)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        self.vfs.lock().await.read(path).map(<[u8]>::to_vec)
    }

    pub async fn stdout(&self) -> Vec<u8> {
        self.vfs.lock().await.stream(StdStream::Stdout).to_vec()
    }

    pub async fn stderr(&self) -> Vec<u8> {
        self.vfs.lock().await.stream(StdStream::Stderr).to_vec()
    }
}

fn tail(stream: &[u8], mark: usize) -> Vec<u8> {
    stream.get(mark..).unwrap_or_default().to_vec()
}
