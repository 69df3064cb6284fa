use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{debug, info, warn};

use crate::{relay::Relay, session};

/// Accepts TCP connections and runs one session task per connection.
pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
    admission: Option<Arc<Semaphore>>,
}

impl Server {
    pub fn new(listener: TcpListener, relay: Arc<Relay>) -> Self {
        Self {
            listener,
            relay,
            admission: None,
        }
    }

    /// Caps simultaneous connections. Extra connections are closed on accept.
    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.admission = Some(Arc::new(Semaphore::new(limit)));
        self
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then drops the listener.
    /// Sessions that are already running are left alone.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            relay,
            admission,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &relay, admission.as_ref());
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    relay: &Arc<Relay>,
    admission: Option<&Arc<Semaphore>>,
) {
    let (stream, peer) = match result {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            return;
        }
    };

    let permit = match admission.map(|limit| Arc::clone(limit).try_acquire_owned()) {
        None => None,
        Some(Ok(permit)) => Some(permit),
        Some(Err(_)) => {
            warn!(peer = %peer, "connection limit reached, closing connection");
            return;
        }
    };

    spawn_session(stream, peer, relay, permit);
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    relay: &Arc<Relay>,
    permit: Option<OwnedSemaphorePermit>,
) {
    let relay = Arc::clone(relay);
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        let end = session::serve(relay, BufReader::new(reader), writer).await;
        debug!(peer = %peer, ?end, "connection finished");
        drop(permit);
    });
}
