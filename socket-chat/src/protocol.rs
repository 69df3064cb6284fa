//! Wire vocabulary shared by the server and the terminal client.
//!
//! Every line on the wire is UTF-8 terminated by `\n`. Apart from the
//! nickname handshake, a line is either one of the literal commands below or
//! free-form chat that the server relays verbatim.

use std::io;

use chrono::{Local, NaiveTime};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const WARNING: &str = "warning";
pub const STOP_CLIENT_FROM_SERVER: &str = "stop client from server";
pub const STOP_CLIENT: &str = "stop client";
pub const STOP_ALL_CLIENTS: &str = "stop all clients";
pub const STOP_SERVER: &str = "stop server";

/// First line of a history replay block.
pub const HISTORY_HEADER: &str = "History messages";
/// Last line of a history replay block.
pub const HISTORY_TRAILER: &str = "...";

const TIME_FORMAT: &str = "%H:%M:%S";

/// One incoming line, classified once.
///
/// Matching is exact, case-sensitive equality against the whole line. Anything
/// else, including near misses such as `"Warning"` or `"stop client "`, is chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Warning,
    StopClientFromServer,
    StopClient,
    StopAllClients,
    StopServer,
    Chat(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        match line {
            WARNING => Command::Warning,
            STOP_CLIENT_FROM_SERVER => Command::StopClientFromServer,
            STOP_CLIENT => Command::StopClient,
            STOP_ALL_CLIENTS => Command::StopAllClients,
            STOP_SERVER => Command::StopServer,
            text => Command::Chat(text),
        }
    }

    /// The exact text this command travels as.
    pub fn as_str(&self) -> &'a str {
        match self {
            Command::Warning => WARNING,
            Command::StopClientFromServer => STOP_CLIENT_FROM_SERVER,
            Command::StopClient => STOP_CLIENT,
            Command::StopAllClients => STOP_ALL_CLIENTS,
            Command::StopServer => STOP_SERVER,
            Command::Chat(text) => text,
        }
    }

    /// Raw literals the server sends right before it closes a client's stream.
    pub fn ends_client(&self) -> bool {
        matches!(
            self,
            Command::StopClientFromServer | Command::StopAllClients | Command::StopServer
        )
    }
}

/// Wall-clock source used to timestamp relay messages.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveTime;
}

/// Local time of day from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Always reports the same instant. Handy for deterministic output.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveTime {
        self.0
    }
}

/// `[HH:MM:SS] text`
pub fn format_message(clock: &dyn Clock, text: &str) -> String {
    format!("[{}] {}", clock.now().format(TIME_FORMAT), text)
}

/// `[nick]`
pub fn format_nickname(nickname: &str) -> String {
    format!("[{nickname}]")
}

/// `[HH:MM:SS] text [command] to nick`
pub fn format_command_message(clock: &dyn Clock, text: &str, nickname: &str) -> String {
    format!("{} [command] to {}", format_message(clock, text), nickname)
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Reads `\n`-terminated lines, replacing invalid UTF-8 instead of failing.
///
/// A trailing `\r` is stripped along with the newline. Bytes read by a
/// cancelled [`LineReader::next_line`] stay buffered for the next call.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Returns `None` at end of stream. A final line without a newline is
    /// still returned.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.reader.read_until(b'\n', &mut self.buf).await?;
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut end = self.buf.len();
        if self.buf[end - 1] == b'\n' {
            end -= 1;
            if end > 0 && self.buf[end - 1] == b'\r' {
                end -= 1;
            }
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}
