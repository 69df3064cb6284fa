//! State shared by every session: who is online, what was said, and how to
//! stamp and fan out new lines.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info};

use crate::{
    history::History,
    protocol::{self, Clock, LocalClock},
    registry::{Peer, RegisterError, Registry, SessionId},
};

/// Ends the whole process when a client asks for `stop server`.
pub trait Terminator: Send + Sync {
    fn terminate(&self);
}

/// Exits immediately with status 0. In-flight writes elsewhere are abandoned.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self) {
        std::process::exit(0);
    }
}

pub struct Relay {
    registry: Registry,
    history: History,
    clock: Arc<dyn Clock>,
    terminator: Arc<dyn Terminator>,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            registry: Registry::new(),
            history: History::new(history_capacity),
            clock: Arc::new(LocalClock),
            terminator: Arc::new(ProcessExit),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_terminator<T>(mut self, terminator: T) -> Self
    where
        T: Terminator + 'static,
    {
        self.terminator = Arc::new(terminator);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn format_message(&self, text: &str) -> String {
        protocol::format_message(self.clock.as_ref(), text)
    }

    pub fn format_command_message(&self, text: &str, nickname: &str) -> String {
        protocol::format_command_message(self.clock.as_ref(), text, nickname)
    }

    /// Adds `peer` to the registry and queues the history replay for it.
    ///
    /// Both happen under the history lock, as does every broadcast, so each
    /// broadcast line reaches the newcomer exactly once: inside the replay if
    /// it was recorded first, live otherwise.
    pub async fn admit(&self, peer: &Peer) -> Result<(), RegisterError> {
        let history = self.history.lock().await;
        self.registry.try_add(peer.clone())?;
        if let Err(error) = history.replay_to(peer) {
            debug!(nickname = peer.nickname(), ?error, "failed to queue history replay");
        }
        Ok(())
    }

    /// Logs `line`, records it in history, and queues it for every active peer.
    ///
    /// Delivery is best effort and never waits on a stream. A peer that is
    /// closed or has a full outbox is dropped from the registry and closed,
    /// and the remaining peers still get the line.
    pub async fn broadcast(&self, line: &str) {
        let mut history = self.history.lock().await;
        info!(target: "socket_chat::broadcast", "{line}");
        history.append(line);
        for peer in self.registry.snapshot() {
            if let Err(error) = peer.send(line) {
                debug!(nickname = peer.nickname(), ?error, "dropping peer after failed delivery");
                self.registry.remove(&peer);
                peer.close();
            }
        }
    }

    /// Sends `literal` to every active peer, then closes them all and empties
    /// the registry. Returns how many peers were disconnected.
    ///
    /// Waits for the streams to shut down, but a stalled peer holds this up
    /// for at most [`CLOSE_GRACE`](crate::registry::CLOSE_GRACE).
    pub async fn disconnect_all(&self, literal: &str) -> usize {
        let peers = self.registry.drain();
        for peer in &peers {
            if let Err(error) = peer.send(literal) {
                debug!(nickname = peer.nickname(), ?error, "failed to deliver stop notice");
            }
            peer.close();
        }
        for peer in &peers {
            peer.finished().await;
        }
        peers.len()
    }

    pub fn terminate_process(&self) {
        self.terminator.terminate();
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(History::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        sync::atomic::AtomicUsize,
        task::{Context, Poll},
        time::Duration,
    };

    use chrono::NaiveTime;
    use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader, DuplexStream, Lines};

    use super::*;
    use crate::{protocol::FixedClock, registry::OUTBOX_CAPACITY};

    struct CountingTerminator(Arc<AtomicUsize>);

    impl Terminator for CountingTerminator {
        fn terminate(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn relay() -> Relay {
        Relay::default().with_clock(FixedClock(NaiveTime::from_hms_opt(9, 30, 0).unwrap()))
    }

    fn join(relay: &Relay, nickname: &str) -> (Peer, Lines<BufReader<DuplexStream>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer = Peer::new(relay.next_session_id(), nickname, server);
        relay.registry().try_add(peer.clone()).expect("unique nickname");
        (peer, BufReader::new(client).lines())
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer_and_history() {
        let relay = relay();
        let (_alice, mut alice_lines) = join(&relay, "alice");
        let (_bob, mut bob_lines) = join(&relay, "bob");

        let line = relay.format_message("Warning from [bob]");
        relay.broadcast(&line).await;

        assert_eq!(
            alice_lines.next_line().await.unwrap().as_deref(),
            Some("[09:30:00] Warning from [bob]")
        );
        assert_eq!(
            bob_lines.next_line().await.unwrap().as_deref(),
            Some("[09:30:00] Warning from [bob]")
        );
        assert_eq!(relay.history().snapshot().await, vec![line]);
    }

    #[tokio::test]
    async fn failing_peer_does_not_block_the_rest() {
        let relay = relay();
        let broken = Peer::new(relay.next_session_id(), "broken", BrokenWriter);
        relay.registry().try_add(broken.clone()).unwrap();
        let (_alice, mut alice_lines) = join(&relay, "alice");

        relay.broadcast("first").await;
        broken.finished().await;
        assert!(broken.is_closed());
        relay.broadcast("second").await;

        assert_eq!(alice_lines.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(alice_lines.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(relay.registry().nicknames(), vec!["alice"]);
    }

    #[tokio::test]
    async fn disconnect_all_sends_literal_then_closes() {
        let relay = relay();
        let (alice, mut alice_lines) = join(&relay, "alice");
        let (bob, mut bob_lines) = join(&relay, "bob");

        assert_eq!(relay.disconnect_all("stop all clients").await, 2);

        assert!(relay.registry().is_empty());
        for lines in [&mut alice_lines, &mut bob_lines] {
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("stop all clients"));
            assert_eq!(lines.next_line().await.unwrap(), None);
        }
        assert!(alice.send("after").is_err());
        assert!(bob.send("after").is_err());
    }

    #[tokio::test]
    async fn client_that_never_reads_cannot_stall_stop_server() {
        let terminations = Arc::new(AtomicUsize::new(0));
        let relay = relay().with_terminator(CountingTerminator(Arc::clone(&terminations)));

        // Eight bytes of buffer that nobody drains.
        let (_sleepy_end, sleepy_stream) = tokio::io::duplex(8);
        let sleepy = Peer::new(relay.next_session_id(), "sleepy", sleepy_stream);
        relay.registry().try_add(sleepy.clone()).unwrap();
        let (_bob, mut bob_lines) = join(&relay, "bob");

        let finished = tokio::time::timeout(Duration::from_secs(2), async {
            for index in 0..OUTBOX_CAPACITY + 8 {
                relay.broadcast(&format!("chatter {index}")).await;
                // Lets bob's writer keep up; sleepy's never can.
                tokio::task::yield_now().await;
            }
            relay.broadcast("[09:30:00] Stop server from [bob]").await;
            relay.disconnect_all("stop server").await;
            relay.terminate_process();
        })
        .await;

        assert!(finished.is_ok(), "stop server must not wait on a stalled client");
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(sleepy.is_closed());
        assert!(relay.registry().is_empty());

        for index in 0..OUTBOX_CAPACITY + 8 {
            assert_eq!(bob_lines.next_line().await.unwrap(), Some(format!("chatter {index}")));
        }
        assert_eq!(
            bob_lines.next_line().await.unwrap().as_deref(),
            Some("[09:30:00] Stop server from [bob]")
        );
        assert_eq!(bob_lines.next_line().await.unwrap().as_deref(), Some("stop server"));
        assert_eq!(bob_lines.next_line().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn joining_during_broadcasts_sees_every_line_once() {
        const LINES: usize = 200;
        let relay = Arc::new(relay());

        let chatter = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                for index in 0..LINES {
                    relay.broadcast(&index.to_string()).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        let newcomer = Peer::new(relay.next_session_id(), "newcomer", server);
        relay.admit(&newcomer).await.expect("unique nickname");
        chatter.await.unwrap();
        newcomer.close();

        let mut lines = BufReader::new(client).lines();
        let mut received = Vec::new();
        let mut first = true;
        while let Some(line) = lines.next_line().await.unwrap() {
            if line == "History messages" {
                assert!(first, "replay header must come before any live line");
            } else if line != "..." {
                received.push(line.parse::<usize>().expect("numbered line"));
            }
            first = false;
        }

        let start = received.first().copied().unwrap_or(LINES);
        let expected: Vec<usize> = (start..LINES).collect();
        assert_eq!(received, expected, "no line may be missed or repeated");
    }

    #[test]
    fn session_ids_are_unique() {
        let relay = Relay::default();
        let first = relay.next_session_id();
        let second = relay.next_session_id();
        assert_ne!(first, second);
    }
}
