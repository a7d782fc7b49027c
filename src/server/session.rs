//! Replication sessions: an ordered, bidirectional message pipe to one peer.
//!
//! A session is a pair of halves. `SessionTx` sends messages to the peer and
//! can be closed from any task; `SessionRx` yields messages from the peer
//! and returns `None` once the peer (or our own side) has closed. Sessions
//! are either in-memory channel pairs or backed by a TCP connection with a
//! messenger task doing the framing.

use std::sync::Mutex;

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::proto::ReplMsg;
use crate::utils::{safe_tcp_read, safe_tcp_write, ChorusError};

/// Sending half of a session.
pub struct SessionTx {
    tx_send: Mutex<Option<mpsc::UnboundedSender<ReplMsg>>>,
}

/// Receiving half of a session.
pub struct SessionRx {
    rx_recv: mpsc::UnboundedReceiver<ReplMsg>,
}

impl SessionTx {
    fn new(tx_send: mpsc::UnboundedSender<ReplMsg>) -> Self {
        SessionTx {
            tx_send: Mutex::new(Some(tx_send)),
        }
    }

    /// Queues a message for the peer. Fails if the session is closed.
    pub fn send(&self, msg: ReplMsg) -> Result<(), ChorusError> {
        let guard = self
            .tx_send
            .lock()
            .map_err(|_| ChorusError::msg("session lock poisoned"))?;
        match guard.as_ref() {
            Some(tx_send) => tx_send
                .send(msg)
                .map_err(|_| ChorusError::transport("session closed")),
            None => Err(ChorusError::transport("session closed")),
        }
    }

    /// Closes the session; the peer's receiving half then ends. Idempotent.
    pub fn close(&self) {
        if let Ok(mut guard) = self.tx_send.lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.tx_send.lock() {
            Ok(guard) => guard.as_ref().map_or(true, |tx| tx.is_closed()),
            Err(_) => true,
        }
    }
}

impl SessionRx {
    /// Waits for the next message; `None` means the session is over.
    pub async fn recv(&mut self) -> Option<ReplMsg> {
        self.rx_recv.recv().await
    }
}

/// Creates two connected in-memory sessions: messages sent on one end's
/// `SessionTx` arrive at the other end's `SessionRx`.
pub fn session_pair() -> ((SessionTx, SessionRx), (SessionTx, SessionRx)) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();
    (
        (SessionTx::new(tx_a), SessionRx { rx_recv: rx_a }),
        (SessionTx::new(tx_b), SessionRx { rx_recv: rx_b }),
    )
}

/// Wraps a connected TCP stream into a session, spawning the messenger task
/// that frames messages in both directions. The task exits, and the
/// connection is dropped, once either the local `SessionTx` is closed or the
/// remote end goes away.
pub fn tcp_session(
    conn: TcpStream,
    peer: String,
) -> (SessionTx, SessionRx, JoinHandle<()>) {
    let (tx_send, rx_send) = mpsc::unbounded_channel();
    let (tx_recv, rx_recv) = mpsc::unbounded_channel();
    let (conn_read, conn_write) = conn.into_split();

    let messenger_handle = tokio::spawn(session_messenger_thread(
        peer, conn_read, conn_write, rx_send, tx_recv,
    ));

    (
        SessionTx::new(tx_send),
        SessionRx { rx_recv },
        messenger_handle,
    )
}

/// Reads a replication message from the connection.
async fn read_msg(
    read_buf: &mut BytesMut,
    conn_read: &mut OwnedReadHalf,
) -> Result<ReplMsg, ChorusError> {
    safe_tcp_read(read_buf, conn_read).await
}

/// Writes a replication message to the connection.
fn write_msg(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &OwnedWriteHalf,
    msg: Option<&ReplMsg>,
) -> Result<bool, ChorusError> {
    safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
}

/// Session messenger thread function.
async fn session_messenger_thread(
    peer: String,
    mut conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    mut rx_send: mpsc::UnboundedReceiver<ReplMsg>,
    tx_recv: mpsc::UnboundedSender<ReplMsg>,
) {
    pf_debug!("session_messenger thread for '{}' spawned", peer);

    let mut read_buf = BytesMut::new();
    let mut write_buf = BytesMut::new();
    let mut write_buf_cursor = 0;

    let mut retrying = false;
    loop {
        tokio::select! {
            // gets a message to send to the peer
            msg = rx_send.recv(), if !retrying => {
                match msg {
                    Some(msg) => {
                        match write_msg(
                            &mut write_buf,
                            &mut write_buf_cursor,
                            &conn_write,
                            Some(&msg),
                        ) {
                            Ok(true) => {}
                            Ok(false) => {
                                pf_debug!("should start retrying send to '{}'", peer);
                                retrying = true;
                            }
                            Err(e) => {
                                pf_warn!("error sending to '{}': {}", peer, e);
                                break;
                            }
                        }
                    },
                    None => break, // session closed locally
                }
            },

            // retrying last unsuccessful send
            _ = conn_write.writable(), if retrying => {
                match write_msg(
                    &mut write_buf,
                    &mut write_buf_cursor,
                    &conn_write,
                    None,
                ) {
                    Ok(true) => {
                        pf_debug!("finished retrying last send to '{}'", peer);
                        retrying = false;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        pf_warn!("error retrying send to '{}': {}", peer, e);
                        break;
                    }
                }
            },

            // receives a message from the peer
            msg = read_msg(&mut read_buf, &mut conn_read) => {
                match msg {
                    Ok(msg) => {
                        if tx_recv.send(msg).is_err() {
                            break; // local receiving half dropped
                        }
                    },
                    Err(e) => {
                        pf_debug!("session with '{}' ended: {}", peer, e);
                        break;
                    }
                }
            },
        }
    }

    pf_debug!("session_messenger thread for '{}' exitted", peer);
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::proto::AckMsg;
    use crate::proto::ChangeNumber;
    use crate::utils::{tcp_bind_with_retry, tcp_connect_with_retry};
    use std::net::SocketAddr;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pair_delivers_and_closes() -> Result<(), ChorusError> {
        let ((tx_a, mut rx_a), (tx_b, mut rx_b)) = session_pair();
        tx_a.send(ReplMsg::WindowProbe)?;
        tx_b.send(ReplMsg::Window { num_ack: 4 })?;
        assert_eq!(rx_b.recv().await, Some(ReplMsg::WindowProbe));
        assert_eq!(rx_a.recv().await, Some(ReplMsg::Window { num_ack: 4 }));

        tx_a.close();
        tx_a.close();
        assert!(tx_a.is_closed());
        assert!(tx_a.send(ReplMsg::WindowProbe).is_err());
        assert_eq!(rx_b.recv().await, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_session_roundtrip() -> Result<(), ChorusError> {
        let addr: SocketAddr = "127.0.0.1:54820".parse()?;
        let listener = tcp_bind_with_retry(addr, 3).await?;
        let accept = tokio::spawn(async move { listener.accept().await });

        let conn = tcp_connect_with_retry(addr, 3).await?;
        let (tx_c, mut rx_c, _h_c) = tcp_session(conn, "server".into());
        let (stream, _) = accept.await??;
        let (tx_s, mut rx_s, h_s) = tcp_session(stream, "client".into());

        let ack = AckMsg::new(ChangeNumber::new(9, 2, 3));
        tx_c.send(ReplMsg::Ack(ack.clone()))?;
        assert_eq!(rx_s.recv().await, Some(ReplMsg::Ack(ack)));
        tx_s.send(ReplMsg::ResetGenerationId { generation_id: 5 })?;
        assert_eq!(
            rx_c.recv().await,
            Some(ReplMsg::ResetGenerationId { generation_id: 5 })
        );

        // closing one side ends the other
        tx_c.close();
        assert_eq!(rx_s.recv().await, None);
        h_s.await?;
        Ok(())
    }
}
