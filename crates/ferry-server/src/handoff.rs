//! Handoff listener — ingests connections whose descriptors arrive over
//! the local Unix socket.

use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Group;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::errors::BackendError;
use crate::registry::ConnectionRegistry;
use crate::session::run_session;
use crate::transport::Transport;

/// Pause after a failed accept before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Deadline for a peer to deliver its control message. Handoffs run
/// inline in the accept loop, so a connected peer that never sends would
/// otherwise stall every later handoff.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Listener on the filesystem-addressed handoff socket.
///
/// Each accepted peer connection carries exactly one control message with
/// exactly one descriptor; the peer connection is dropped afterwards
/// regardless of outcome. Per-attempt failures are logged and discarded —
/// the listener keeps accepting. Only bootstrap failures are fatal.
#[derive(Debug)]
pub struct HandoffListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl HandoffListener {
    /// Bind the handoff socket per the server configuration.
    pub fn bind(config: &ServerConfig) -> Result<Self, BackendError> {
        Self::bind_path(&config.socket_path, config.socket_group.as_deref())
    }

    /// Bind at `path`, restricting access to `group` when given.
    ///
    /// A stale socket left by a previous run is unlinked; any other kind of
    /// file at the path is refused. With a group the socket is chowned to
    /// it and set to mode `0660`; without one it stays owner-only (`0600`).
    /// Every failure here is startup-fatal.
    pub fn bind_path(path: &Path, group: Option<&str>) -> Result<Self, BackendError> {
        if path.exists() {
            let meta = std::fs::symlink_metadata(path)?;
            if !meta.file_type().is_socket() {
                return Err(BackendError::NotASocket(path.to_path_buf()));
            }
            // Stale socket from a previous run.
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path).map_err(|source| BackendError::SocketBind {
            path: path.to_path_buf(),
            source,
        })?;

        let mode = if let Some(group) = group {
            let gid = Group::from_name(group)
                .map_err(|_| BackendError::UnknownGroup(group.to_owned()))?
                .ok_or_else(|| BackendError::UnknownGroup(group.to_owned()))?
                .gid;
            std::os::unix::fs::chown(path, None, Some(gid.as_raw())).map_err(|source| {
                BackendError::Permissions {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            0o660
        } else {
            0o600
        };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(
            |source| BackendError::Permissions {
                path: path.to_path_buf(),
                source,
            },
        )?;

        let mode_str = format!("{mode:o}");
        info!(path = %path.display(), mode = %mode_str, "handoff socket bound");
        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Path the socket is bound at.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Spawn the accept loop. Runs until `cancel` fires, then unlinks the
    /// socket file.
    pub fn spawn(
        self,
        registry: Arc<ConnectionRegistry>,
        hello_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop(registry, hello_interval, cancel))
    }

    async fn accept_loop(
        self,
        registry: Arc<ConnectionRegistry>,
        hello_interval: Duration,
        cancel: CancellationToken,
    ) {
        info!("listening for descriptor handoffs");
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "handoff accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            // One handoff per peer connection, bounded by the deadline.
            let received =
                tokio::time::timeout(RECV_TIMEOUT, ferry_fdpass::recv_fd(&stream)).await;
            drop(stream);
            let fd = match received {
                Ok(Ok(fd)) => fd,
                Ok(Err(e)) => {
                    warn!(error = %e, "handoff attempt discarded");
                    continue;
                }
                Err(_) => {
                    warn!(
                        timeout_secs = RECV_TIMEOUT.as_secs(),
                        "handoff peer sent nothing before the deadline"
                    );
                    continue;
                }
            };

            // Identity is the descriptor number, captured before adoption
            // consumes the fd.
            let id = ConnectionId::from_fd(fd.as_raw_fd());
            let tcp = match ferry_fdpass::into_tcp_stream(fd) {
                Ok(tcp) => tcp,
                Err(e) => {
                    warn!(conn_id = %id, error = %e, "received descriptor unusable");
                    continue;
                }
            };
            debug!(conn_id = %id, "descriptor received");

            // The peer performed the protocol handshake before handing the
            // socket over; frames flow immediately.
            let ws = WebSocketStream::from_raw_socket(tcp, Role::Server, None).await;
            let (reader, writer) = Transport::Handoff(ws).split();
            let connection = Arc::new(Connection::new(id, writer));
            if let Err(e) = registry.insert(connection.clone()).await {
                error!(error = %e, "dropping handed-off connection");
                continue;
            }

            // Fire and forget; the loop never waits on a session.
            drop(tokio::spawn(run_session(
                connection,
                reader,
                registry.clone(),
                hello_interval,
            )));
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "socket cleanup failed");
        }
    }
}
