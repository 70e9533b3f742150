//! Per-connection session state machine — two concurrent loops over one
//! shared transport, raced into a single idempotent teardown.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::metrics as names;
use crate::registry::ConnectionRegistry;
use crate::transport::{Frame, TransportReader};

/// Literal payload of the periodic outbound text frame. Existing clients
/// match on these exact bytes.
pub const HELLO_PAYLOAD: &str = "Hello from backend";

/// Run a session for a registered connection until teardown.
///
/// Spawns the outbound hello loop, then drives the inbound dispatch loop in
/// this task. Whichever loop first observes a terminal condition runs
/// [`teardown`]; the other loop wakes on the cancelled token, sees it lost
/// the race, and exits without touching anything. Every failure path is
/// confined to this one connection.
#[instrument(skip_all, fields(conn_id = %conn.id))]
pub async fn run_session(
    conn: Arc<Connection>,
    mut reader: TransportReader,
    registry: Arc<ConnectionRegistry>,
    hello_interval: Duration,
) {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
    info!(
        origin = if conn.id.is_sentinel() { "direct" } else { "handoff" },
        "connection registered"
    );

    let outbound = tokio::spawn(outbound_loop(
        conn.clone(),
        registry.clone(),
        hello_interval,
    ));

    let cancel = conn.cancel_token();
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = reader.next_frame() => frame,
        };
        match frame {
            Some(Ok(Frame::Text(payload))) => {
                // Opaque to the backend; observed only.
                info!(len = payload.len(), payload = %payload, "text received");
            }
            Some(Ok(Frame::Ping(_))) => {
                // The codec queues the single pong reply itself.
                debug!("ping received");
            }
            Some(Ok(Frame::Pong(_) | Frame::Binary(_))) => {}
            Some(Ok(Frame::Close)) => {
                info!("peer sent close");
                teardown(&conn, &registry).await;
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "read failed");
                teardown(&conn, &registry).await;
                break;
            }
            None => {
                debug!("stream ended");
                teardown(&conn, &registry).await;
                break;
            }
        }
    }

    // Bounded by the cancelled token, so this cannot hang.
    let _ = outbound.await;
}

/// Send the hello frame on a fixed period until the session closes.
async fn outbound_loop(
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    hello_interval: Duration,
) {
    let cancel = conn.cancel_token();
    let mut hello = tokio::time::interval(hello_interval);
    // Consume the immediate first tick; the first send lands one full
    // period after session start.
    let _ = hello.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = hello.tick() => {
                // A send parked on an unreadable peer holds the writer
                // lock; racing it against the token lets cancellation drop
                // the send future (and release the lock) so teardown's
                // take_writer() can proceed.
                let outcome = tokio::select! {
                    () = cancel.cancelled() => break,
                    outcome = send_hello(&conn) => outcome,
                };
                match outcome {
                    HelloOutcome::Sent => {
                        counter!(names::MESSAGES_SENT_TOTAL).increment(1);
                        debug!(payload = HELLO_PAYLOAD, "message sent");
                    }
                    // Writer already taken means teardown won elsewhere.
                    HelloOutcome::WriterTaken => break,
                    HelloOutcome::Failed(e) => {
                        warn!(error = %e, "write failed");
                        teardown(&conn, &registry).await;
                        break;
                    }
                }
            }
        }
    }
}

enum HelloOutcome {
    Sent,
    WriterTaken,
    Failed(crate::errors::TransportError),
}

async fn send_hello(conn: &Connection) -> HelloOutcome {
    let mut writer = conn.lock_writer().await;
    let Some(w) = writer.as_mut() else {
        return HelloOutcome::WriterTaken;
    };
    match w.send_text(HELLO_PAYLOAD).await {
        Ok(()) => HelloOutcome::Sent,
        Err(e) => HelloOutcome::Failed(e),
    }
}

/// Single idempotent teardown shared by both loops.
///
/// The `Open -> Closing` check-and-set elects exactly one winner; it
/// cancels the token so the losing loop unblocks, closes the transport
/// once (via the take-once writer), removes the registry entry once, and
/// marks the connection `Closed`. Later callers observe the transition and
/// return immediately.
pub async fn teardown(conn: &Connection, registry: &ConnectionRegistry) {
    if !conn.begin_close() {
        return;
    }
    // Cancel before taking the writer: an in-flight hello holds the writer
    // lock, and the outbound loop releases it only on cancellation.
    conn.cancel();
    if let Some(mut writer) = conn.take_writer().await {
        let _ = writer.close().await;
    }
    let _ = registry.remove(conn.id).await;
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(names::CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    conn.mark_closed();
    info!(conn_id = %conn.id, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use crate::connection::{ConnectionId, ConnectionState};
    use crate::transport::Transport;

    const TIMEOUT: Duration = Duration::from_secs(3);

    type ClientWs = WebSocketStream<TcpStream>;

    /// Boot a session over a real loopback WebSocket pair.
    async fn boot_session(
        id: i32,
        hello_interval: Duration,
    ) -> (Arc<Connection>, Arc<ConnectionRegistry>, ClientWs) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = async { listener.accept().await.unwrap().0 };
        let (client, server) = tokio::join!(connect, accept);
        let client = WebSocketStream::from_raw_socket(client.unwrap(), Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;

        let (reader, writer) = Transport::Handoff(server).split();
        let conn = Arc::new(Connection::new(ConnectionId::from_fd(id), writer));
        let registry = Arc::new(ConnectionRegistry::new());
        registry.insert(conn.clone()).await.unwrap();

        drop(tokio::spawn(run_session(
            conn.clone(),
            reader,
            registry.clone(),
            hello_interval,
        )));
        (conn, registry, client)
    }

    async fn next_message(client: &mut ClientWs) -> Message {
        timeout(TIMEOUT, client.next())
            .await
            .expect("frame within timeout")
            .expect("stream still open")
            .expect("frame decodes")
    }

    /// Poll until the registry drains or the timeout lapses.
    async fn wait_until_empty(registry: &ConnectionRegistry) {
        for _ in 0..300 {
            if registry.count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never drained");
    }

    #[tokio::test]
    async fn hello_sent_on_cadence_with_verbatim_payload() {
        let (_conn, _registry, mut client) =
            boot_session(11, Duration::from_millis(50)).await;

        let first = next_message(&mut client).await;
        assert_eq!(first, Message::Text(HELLO_PAYLOAD.into()));
        let second = next_message(&mut client).await;
        assert_eq!(second, Message::Text(HELLO_PAYLOAD.into()));
    }

    #[tokio::test]
    async fn ping_yields_exactly_one_pong() {
        // Long hello interval keeps outbound traffic out of the way.
        let (_conn, _registry, mut client) =
            boot_session(12, Duration::from_secs(600)).await;

        client
            .send(Message::Ping(vec![0xAB].into()))
            .await
            .unwrap();

        let reply = next_message(&mut client).await;
        assert_eq!(reply, Message::Pong(vec![0xAB].into()));

        // No second pong (or anything else) follows.
        let extra = timeout(Duration::from_millis(200), client.next()).await;
        assert!(extra.is_err(), "unexpected extra frame: {extra:?}");
    }

    #[tokio::test]
    async fn text_is_observed_and_keeps_the_session_alive() {
        let (conn, registry, mut client) =
            boot_session(13, Duration::from_secs(600)).await;

        client.send(Message::Text("hi".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(registry.contains(conn.id).await);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn close_frame_tears_down_without_application_reply() {
        let (conn, registry, mut client) =
            boot_session(14, Duration::from_secs(600)).await;

        client.send(Message::Close(None)).await.unwrap();
        wait_until_empty(&registry).await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Only the codec's close handshake comes back, never a text frame.
        while let Ok(Some(Ok(msg))) = timeout(Duration::from_millis(200), client.next()).await {
            assert!(matches!(msg, Message::Close(_)));
        }
    }

    #[tokio::test]
    async fn abrupt_peer_loss_tears_down_exactly_once() {
        // A tight hello interval makes the outbound loop fail concurrently
        // with the inbound loop's read error.
        let (conn, registry, client) = boot_session(15, Duration::from_millis(10)).await;

        // Drop the client without a close handshake; the socket just goes
        // away under both loops.
        drop(client);

        wait_until_empty(&registry).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        // The loser's attempt was a no-op: the entry was removed once.
        assert!(!registry.remove(conn.id).await);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (conn, registry, _client) =
            boot_session(16, Duration::from_secs(600)).await;

        teardown(&conn, &registry).await;
        assert_eq!(registry.count().await, 0);
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Second invocation observes the state and does nothing.
        teardown(&conn, &registry).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.take_writer().await.is_none());
    }

    #[tokio::test]
    async fn teardown_is_not_blocked_by_a_held_writer_lock() {
        let (conn, registry, _client) =
            boot_session(18, Duration::from_secs(600)).await;

        // Holds the writer lock the way a send parked on an unreadable
        // peer would, releasing it only once the token fires.
        let holder = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let guard = conn.lock_writer().await;
                conn.cancel_token().cancelled().await;
                drop(guard);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        timeout(TIMEOUT, teardown(&conn, &registry))
            .await
            .expect("teardown must not wait behind the writer lock");
        holder.await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn teardown_unblocks_the_other_loop() {
        let (conn, registry, mut client) =
            boot_session(17, Duration::from_secs(600)).await;

        teardown(&conn, &registry).await;

        // The inbound loop exits via the cancelled token and the transport
        // closes, so the client's stream ends.
        while let Ok(Some(Ok(_))) = timeout(TIMEOUT, client.next()).await {}
        assert_eq!(registry.count().await, 0);
    }
}
