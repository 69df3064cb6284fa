use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{Clock, Command, LocalClock, format_message, write_line},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    write_line(&mut writer, &args.nickname)
        .await
        .context("failed to send nickname")?;

    let mut server_lines = reader.lines();
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut server_lines, &mut stdin_lines, &mut writer, &LocalClock).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    server_lines: &mut io::Lines<BufReader<OwnedReadHalf>>,
    stdin_lines: &mut io::Lines<BufReader<io::Stdin>>,
    writer: &mut OwnedWriteHalf,
    clock: &dyn Clock,
) -> Result<()> {
    loop {
        select! {
            server_line = server_lines.next_line() => {
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            stdin_line = stdin_lines.next_line() => {
                match stdin_line? {
                    Some(text) => send_input(&text, writer, clock).await?,
                    None => break,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

/// Prints one relay line. Returns `false` once the relay is done with us.
async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    match line? {
        Some(line) => {
            write_stdout(&line).await?;
            Ok(!Command::parse(&line).ends_client())
        }
        None => Ok(false),
    }
}

/// Commands go out as typed. Anything else is stamped with the local time first.
async fn send_input<W>(text: &str, writer: &mut W, clock: &dyn Clock) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if text.is_empty() {
        return Ok(());
    }

    let outgoing = match Command::parse(text) {
        Command::Chat(text) => format_message(clock, text),
        command => command.as_str().to_string(),
    };
    write_line(writer, &outgoing).await?;
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        // The relay usually hangs up first.
        debug!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
