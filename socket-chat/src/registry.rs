//! Live sessions, keyed by nickname.

use std::{io, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::sleep,
};
use tracing::debug;

use crate::protocol::write_line;

pub type SessionId = u64;

/// Lines a peer may have queued before it counts as too slow to keep.
pub const OUTBOX_CAPACITY: usize = 256;

/// How long a closed peer's writer may keep flushing queued lines.
pub const CLOSE_GRACE: Duration = Duration::from_millis(500);

enum Outbound {
    Line(String),
    Block(Vec<String>),
}

/// Write side of one session, shared between its own task and the registry.
///
/// Cloning is cheap. Sends only queue the line; a dedicated writer task owns
/// the stream, so a client that stops reading never holds up the sender.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: SessionId,
    nickname: String,
    outbox: mpsc::Sender<Outbound>,
    closed: Arc<watch::Sender<bool>>,
    writer_done: watch::Receiver<()>,
}

impl Peer {
    /// Wraps `writer` and spawns the task that drains this peer's outbox into
    /// it. Must be called from within a Tokio runtime.
    pub fn new<W>(id: SessionId, nickname: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let nickname = nickname.into();
        let (outbox, queued) = mpsc::channel(OUTBOX_CAPACITY);
        let closed = Arc::new(watch::channel(false).0);
        let (done_tx, writer_done) = watch::channel(());

        tokio::spawn(run_writer(
            nickname.clone(),
            writer,
            queued,
            Arc::clone(&closed),
            done_tx,
        ));

        Self {
            inner: Arc::new(PeerInner {
                id,
                nickname,
                outbox,
                closed,
                writer_done,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn nickname(&self) -> &str {
        &self.inner.nickname
    }

    /// Queues one line. Fails if the peer is closed or its outbox is full.
    pub fn send(&self, line: &str) -> io::Result<()> {
        self.enqueue(Outbound::Line(line.to_string()))
    }

    /// Queues several lines that reach the stream back to back.
    pub fn send_block(&self, lines: Vec<String>) -> io::Result<()> {
        self.enqueue(Outbound::Block(lines))
    }

    fn enqueue(&self, message: Outbound) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.inner.outbox.try_send(message).map_err(|error| match error {
            TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "peer outbox full")
            }
            TrySendError::Closed(_) => closed_error(),
        })
    }

    /// Marks the peer closed. Lines already queued still get [`CLOSE_GRACE`]
    /// to reach the stream before it is shut down. Never waits on the stream.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once [`Peer::close`] has been called by anyone, or the writer
    /// gave up on the stream.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Waits until the writer task has shut the stream down or abandoned it.
    pub async fn finished(&self) {
        let mut done = self.inner.writer_done.clone();
        while done.changed().await.is_ok() {}
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("nickname", &self.inner.nickname)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "peer stream closed")
}

/// Owns the stream of one peer. Runs until the peer is closed and its queue
/// is flushed, or until [`CLOSE_GRACE`] after close if the stream is stuck.
async fn run_writer<W>(
    nickname: String,
    mut writer: W,
    mut queued: mpsc::Receiver<Outbound>,
    closed: Arc<watch::Sender<bool>>,
    _done: watch::Sender<()>,
) where
    W: AsyncWrite + Unpin,
{
    let mut deadline_signal = closed.subscribe();
    let deadline = async move {
        wait_closed(&mut deadline_signal).await;
        sleep(CLOSE_GRACE).await;
    };

    let mut close_signal = closed.subscribe();
    let result = select! {
        result = deliver(&mut writer, &mut queued, &mut close_signal) => result,
        _ = deadline => {
            debug!(nickname = %nickname, "abandoning stalled stream after close");
            return;
        }
    };

    if let Err(error) = result {
        debug!(nickname = %nickname, ?error, "peer stream failed");
        closed.send_replace(true);
    }
}

async fn deliver<W>(
    writer: &mut W,
    queued: &mut mpsc::Receiver<Outbound>,
    closed: &mut watch::Receiver<bool>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            biased;
            message = queued.recv() => match message {
                Some(message) => write_outbound(writer, message).await?,
                None => break,
            },
            _ = wait_closed(closed) => {
                while let Ok(message) = queued.try_recv() {
                    write_outbound(writer, message).await?;
                }
                break;
            }
        }
    }
    writer.shutdown().await
}

async fn write_outbound<W>(writer: &mut W, message: Outbound) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match message {
        Outbound::Line(line) => write_line(writer, &line).await,
        Outbound::Block(lines) => {
            for line in &lines {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.flush().await
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    NicknameTaken,
}

/// Concurrent set of active peers with pairwise-distinct nicknames.
#[derive(Default)]
pub struct Registry {
    peers: DashMap<String, Peer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `peer` unless its nickname is already active.
    ///
    /// The lookup and the insert happen under the same shard lock, so two
    /// sessions racing for one nickname cannot both get in.
    pub fn try_add(&self, peer: Peer) -> Result<(), RegisterError> {
        match self.peers.entry(peer.nickname().to_string()) {
            Entry::Occupied(_) => Err(RegisterError::NicknameTaken),
            Entry::Vacant(slot) => {
                slot.insert(peer);
                Ok(())
            }
        }
    }

    /// Removes `peer` if it is still the entry for its nickname. Returns
    /// whether anything was removed.
    pub fn remove(&self, peer: &Peer) -> bool {
        self.peers
            .remove_if(peer.nickname(), |_, existing| existing.id() == peer.id())
            .is_some()
    }

    pub fn contains(&self, nickname: &str) -> bool {
        self.peers.contains_key(nickname)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Active nicknames in sorted order.
    pub fn nicknames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Copies out the current peers so callers can write without holding map locks.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Empties the registry, handing back everything that was in it.
    pub fn drain(&self) -> Vec<Peer> {
        let mut drained = Vec::with_capacity(self.peers.len());
        self.peers.retain(|_, peer| {
            drained.push(peer.clone());
            false
        });
        drained
    }
}
