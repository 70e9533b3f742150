//! Connection identity and per-connection state.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::transport::TransportWriter;

/// Next synthetic identity for directly-accepted connections. Strictly
/// negative and monotonically decreasing, so it can never collide with a
/// real descriptor number and never repeats within a process lifetime.
static NEXT_SENTINEL: AtomicI64 = AtomicI64::new(-1);

/// Identity of one connection.
///
/// Handed-off connections use the backend-local descriptor number (>= 0);
/// directly-accepted connections use a negative sentinel. An identity is
/// unique among currently-registered connections only — descriptor numbers
/// may be reused by the OS after full teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(i64);

impl ConnectionId {
    /// Identity of a handed-off connection, from its descriptor number.
    pub fn from_fd(fd: RawFd) -> Self {
        Self(i64::from(fd))
    }

    /// Next sentinel identity for a directly-accepted connection.
    pub fn next_sentinel() -> Self {
        Self(NEXT_SENTINEL.fetch_sub(1, Ordering::Relaxed))
    }

    /// Whether this identity is a synthetic sentinel.
    pub fn is_sentinel(self) -> bool {
        self.0 < 0
    }

    /// Raw identity value.
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both session loops running.
    Open,
    /// A loop observed a terminal condition; teardown in progress.
    Closing,
    /// Teardown complete. Terminal.
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One tracked connection: identity, lifecycle state, and the writer half
/// of its transport. The reader half is owned by the session's inbound
/// loop; everything that writes — hello sends and the final close — goes
/// through the mutex-guarded writer slot, so writes never interleave.
pub struct Connection {
    /// Connection identity.
    pub id: ConnectionId,
    state: AtomicU8,
    opened_at: Instant,
    writer: Mutex<Option<TransportWriter>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Track a freshly-established connection in the `Open` state.
    pub fn new(id: ConnectionId, writer: TransportWriter) -> Self {
        Self {
            id,
            state: AtomicU8::new(STATE_OPEN),
            opened_at: Instant::now(),
            writer: Mutex::new(Some(writer)),
            cancel: CancellationToken::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Transition `Open -> Closing`. Exactly one caller wins; losers get
    /// `false` and must not touch the transport or registry.
    pub fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_OPEN,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transition to the terminal `Closed` state.
    pub fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Lock the writer slot. `None` inside means the connection is closing
    /// and the writer has already been taken.
    pub async fn lock_writer(&self) -> MutexGuard<'_, Option<TransportWriter>> {
        self.writer.lock().await
    }

    /// Take the writer out of its slot. Only the teardown winner gets
    /// `Some`; the transport is closed exactly once through it.
    pub async fn take_writer(&self) -> Option<TransportWriter> {
        self.writer.lock().await.take()
    }

    /// Token cancelled at teardown, waking the companion loop out of any
    /// pending await.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the per-connection token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// How long this connection has been tracked.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}
