//! The local stream socket server.
//!
//! One request per connection: a single line of JSON in, a single line of
//! JSON out, then the daemon closes the connection. Binding failures are
//! fatal at boot; everything after that degrades gracefully.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use marvel_core::fsio;
use marvel_core::hook::{HookRequest, HookResponse};
use marvel_core::paths::PathError;

use crate::dispatcher::dispatch;
use crate::state::DaemonState;

/// Requests larger than this are malformed by definition.
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("another daemon is already serving this project")]
    AlreadyRunning,

    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Server {
    state: Arc<DaemonState>,
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl Server {
    /// Bind at the project's well-known socket path.
    pub async fn bind(state: Arc<DaemonState>) -> Result<(Self, UnixListener), DaemonError> {
        let socket_path = state.paths.check_socket_path()?;
        let pid_path = state.paths.pid_path();
        fsio::ensure_private_dir(state.paths.runtime_dir())?;
        Self::bind_at(state, socket_path, pid_path).await
    }

    /// Bind at an explicit path (tests override the runtime directory).
    pub async fn bind_at(
        state: Arc<DaemonState>,
        socket_path: PathBuf,
        pid_path: PathBuf,
    ) -> Result<(Self, UnixListener), DaemonError> {
        if socket_path.exists() {
            // A connectable socket means a live daemon; a dead one is
            // leftover from a crash and can be replaced.
            match UnixStream::connect(&socket_path).await {
                Ok(_) => return Err(DaemonError::AlreadyRunning),
                Err(_) => {
                    debug!(path = %socket_path.display(), "removing stale socket");
                    let _ = std::fs::remove_file(&socket_path);
                }
            }
        }

        let listener = UnixListener::bind(&socket_path).map_err(|source| DaemonError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&socket_path, perms);
        }

        fsio::atomic_write(
            &pid_path,
            format!("{}\n", std::process::id()).as_bytes(),
            Some(0o600),
        )?;

        info!(socket = %socket_path.display(), "daemon listening");
        Ok((
            Self {
                state,
                socket_path,
                pid_path,
            },
            listener,
        ))
    }

    /// Accept until the shutdown signal fires.
    pub async fn run(&self, listener: UnixListener) {
        let mut shutdown = self.state.shutdown_receiver();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                handle_connection(state, stream).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
    }

    /// Unlink socket and PID files.
    pub fn cleanup(&self) {
        for path in [&self.socket_path, &self.pid_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove daemon file");
                }
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(state: Arc<DaemonState>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_REQUEST_BYTES);

    let mut line = String::new();
    let response = match reader.read_line(&mut line).await {
        Ok(0) => HookResponse::empty(),
        Ok(_) => match serde_json::from_str::<HookRequest>(line.trim()) {
            Ok(request) => {
                debug!(hook = request.hook.name(), "request received");
                dispatch(state, request).await
            }
            Err(e) => {
                warn!(error = %e, "malformed request");
                HookResponse::empty()
            }
        },
        Err(e) => {
            warn!(error = %e, "failed to read request");
            HookResponse::empty()
        }
    };

    let mut payload =
        serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
    payload.push('\n');
    if let Err(e) = write_half.write_all(payload.as_bytes()).await {
        warn!(error = %e, "failed to write response");
    }
    let _ = write_half.shutdown().await;
}
