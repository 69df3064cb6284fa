use std::{collections::VecDeque, io};

use tokio::sync::{Mutex, MutexGuard};

use crate::{
    protocol::{HISTORY_HEADER, HISTORY_TRAILER},
    registry::Peer,
};

/// Bounded FIFO of the most recent broadcast lines, oldest first.
pub struct History {
    capacity: usize,
    events: Mutex<VecDeque<String>>,
}

impl History {
    pub const DEFAULT_CAPACITY: usize = 20;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Locks the buffer. Whatever the caller does while holding the guard is
    /// ordered against every other append and replay.
    pub async fn lock(&self) -> HistoryGuard<'_> {
        HistoryGuard {
            capacity: self.capacity,
            events: self.events.lock().await,
        }
    }

    /// Records `line`, evicting the oldest entry once the buffer is full.
    pub async fn append(&self, line: impl Into<String>) {
        self.lock().await.append(line);
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Queues the retained lines for a single peer, framed by the header and
    /// trailer. Nothing is sent while the history is empty.
    pub async fn replay_to(&self, peer: &Peer) -> io::Result<()> {
        self.lock().await.replay_to(peer)
    }
}

pub struct HistoryGuard<'a> {
    capacity: usize,
    events: MutexGuard<'a, VecDeque<String>>,
}

impl HistoryGuard<'_> {
    pub fn append(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(line.into());
    }

    pub fn replay_to(&self, peer: &Peer) -> io::Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        let mut block = Vec::with_capacity(self.events.len() + 2);
        block.push(HISTORY_HEADER.to_string());
        block.extend(self.events.iter().cloned());
        block.push(HISTORY_TRAILER.to_string());
        peer.send_block(block)
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
