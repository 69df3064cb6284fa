//! One connected client, from nickname handshake to disconnect.
//!
//! A session starts `Negotiating`. Its first line is the nickname. A
//! nickname that is already active gets the rejection notices and the session
//! ends. Otherwise the session joins the registry, receives the history
//! replay, announces itself, and turns `Active`. From then on every line is
//! parsed as a [`Command`] and handled until a stop command, an external
//! close, end of stream, or an I/O error.

use std::{io, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{
        Command, LineReader, STOP_ALL_CLIENTS, STOP_CLIENT_FROM_SERVER, STOP_SERVER,
        format_nickname,
    },
    registry::Peer,
    relay::Relay,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Active,
    Terminated,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The stream ended before a nickname arrived.
    NoNickname,
    /// The nickname was already taken.
    Rejected,
    /// The client sent `stop client`.
    Disconnected,
    /// This client sent `stop all clients`.
    StoppedAllClients,
    /// This client sent `stop server`.
    StoppedServer,
    /// Another session closed this one.
    ClosedByPeer,
    /// The client hung up.
    StreamEnded,
    /// Reading from or writing to the client failed.
    Failed,
}

pub struct Session<R> {
    relay: Arc<Relay>,
    lines: LineReader<R>,
    peer: Peer,
    state: SessionState,
}

/// Runs one connection to completion.
pub async fn serve<R, W>(relay: Arc<Relay>, reader: R, writer: W) -> SessionEnd
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    match Session::negotiate(relay, reader, writer).await {
        Ok(Some(session)) => session.run().await,
        Ok(None) => SessionEnd::NoNickname,
        Err(error) => {
            debug!(?error, "failed to read nickname");
            SessionEnd::Failed
        }
    }
}

impl<R> Session<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Reads the nickname line. Returns `None` if the client hung up first.
    pub async fn negotiate<W>(relay: Arc<Relay>, reader: R, writer: W) -> io::Result<Option<Self>>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut lines = LineReader::new(reader);
        let Some(nickname) = lines.next_line().await? else {
            return Ok(None);
        };
        let peer = Peer::new(relay.next_session_id(), nickname, writer);
        Ok(Some(Self {
            relay,
            lines,
            peer,
            state: SessionState::Negotiating,
        }))
    }

    pub fn nickname(&self) -> &str {
        self.peer.nickname()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(mut self) -> SessionEnd {
        let end = match self.drive().await {
            Ok(end) => end,
            Err(error) => {
                debug!(nickname = self.nickname(), ?error, "session i/o failed");
                SessionEnd::Failed
            }
        };
        self.terminate().await;
        debug!(nickname = self.nickname(), ?end, "session terminated");
        end
    }

    async fn drive(&mut self) -> io::Result<SessionEnd> {
        if !self.activate().await? {
            return Ok(SessionEnd::Rejected);
        }

        let mut closed = self.peer.closed_signal();
        loop {
            if self.peer.is_closed() {
                return Ok(SessionEnd::ClosedByPeer);
            }
            let line = select! {
                biased;
                _ = closed.changed() => return Ok(SessionEnd::ClosedByPeer),
                line = self.lines.next_line() => line?,
            };
            let Some(line) = line else {
                return Ok(SessionEnd::StreamEnded);
            };
            if let Some(end) = self.handle_line(&line).await {
                return Ok(end);
            }
        }
    }

    /// Joins the registry and queues the history replay, or runs the
    /// rejection path and returns `false`.
    async fn activate(&mut self) -> io::Result<bool> {
        if self.relay.admit(&self.peer).await.is_err() {
            info!(nickname = self.nickname(), "rejecting duplicate nickname");
            self.reject().await?;
            return Ok(false);
        }

        self.state = SessionState::Active;
        info!(nickname = self.nickname(), "client joined");

        let notice = self
            .relay
            .format_message(&format!("Connect {}", format_nickname(self.nickname())));
        self.relay.broadcast(&notice).await;
        Ok(true)
    }

    async fn reject(&self) -> io::Result<()> {
        let duplicated = format_nickname(&format!("{} (duplicated)", self.nickname()));
        let notice = self
            .relay
            .format_message(&format!("{duplicated} disconnected"));

        self.relay.broadcast(&notice).await;
        self.peer.send(&notice)?;
        self.peer.send(
            &self
                .relay
                .format_command_message(STOP_CLIENT_FROM_SERVER, &duplicated),
        )?;
        self.peer.send(STOP_CLIENT_FROM_SERVER)
    }

    /// Handles one line from an active client. `Some` means the session is over.
    async fn handle_line(&self, line: &str) -> Option<SessionEnd> {
        let relay = &self.relay;
        let nickname = format_nickname(self.nickname());

        match Command::parse(line) {
            Command::Warning => {
                relay
                    .broadcast(&relay.format_message(&format!("Warning from {nickname}")))
                    .await;
                None
            }
            Command::StopClient => {
                relay
                    .broadcast(&relay.format_message(&format!("Disconnect {nickname}")))
                    .await;
                Some(SessionEnd::Disconnected)
            }
            Command::StopAllClients => {
                relay
                    .broadcast(&relay.format_message(&format!("Stop all clients from {nickname}")))
                    .await;
                let closed = relay.disconnect_all(STOP_ALL_CLIENTS).await;
                info!(nickname = self.nickname(), closed, "all clients stopped");
                Some(SessionEnd::StoppedAllClients)
            }
            Command::StopServer => {
                relay
                    .broadcast(&relay.format_message(&format!("Stop server from {nickname}")))
                    .await;
                let closed = relay.disconnect_all(STOP_SERVER).await;
                warn!(nickname = self.nickname(), closed, "server stop requested by client");
                relay.terminate_process();
                Some(SessionEnd::StoppedServer)
            }
            Command::StopClientFromServer | Command::Chat(_) => {
                relay.broadcast(line).await;
                None
            }
        }
    }

    async fn terminate(&mut self) {
        self.relay.registry().remove(&self.peer);
        self.peer.close();
        self.peer.finished().await;
        self.state = SessionState::Terminated;
    }
}
