use std::mem;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    envelope::{Envelope, Payload},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut socket = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = PendingLine::default();

    run_client_loop(&mut socket, &mut stdin, &mut line).await?;
    shutdown_connection(&mut socket).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<Socket> {
    let url = args.url();
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    info!("connected to {url}");
    Ok(socket)
}

async fn run_client_loop(
    socket: &mut Socket,
    stdin: &mut BufReader<tokio::io::Stdin>,
    line: &mut PendingLine,
) -> Result<()> {
    loop {
        select! {
            frame = socket.next() => {
                if !handle_relay_frame(frame).await? {
                    break;
                }
            }
            bytes_read = line.read(stdin) => {
                let input = line.take();
                if !handle_stdin_input(bytes_read, &input, socket).await? {
                    break;
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

/// One stdin line, kept across `select!` iterations.
///
/// A read that loses the race to a relay frame leaves its partial bytes
/// here, and the next read carries on from them.
#[derive(Default)]
struct PendingLine {
    buf: Vec<u8>,
}

impl PendingLine {
    async fn read<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> io::Result<usize> {
        reader.read_until(b'\n', &mut self.buf).await
    }

    /// Hands over the line read so far and starts a new one.
    fn take(&mut self) -> String {
        String::from_utf8_lossy(&mem::take(&mut self.buf)).into_owned()
    }
}

async fn handle_relay_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            render_envelope(&text).await?;
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("relay connection failed"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    socket: &mut Socket,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving relay").await?;
        return Ok(false);
    }

    // Lines go out verbatim: "<target> <payload>" where target is an id or "*".
    socket
        .send(Message::Text(text.to_string()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        warn!(?error, "failed to close relay connection cleanly");
    }
}

async fn render_envelope(text: &str) -> io::Result<()> {
    let envelope = match text.parse::<Envelope>() {
        Ok(envelope) => envelope,
        Err(error) => return write_stderr(&format!("!!! unreadable message ({error}): {text}")).await,
    };

    write_stdout(&describe(&envelope)).await
}

fn describe(envelope: &Envelope) -> String {
    let source = envelope.source;
    match &envelope.payload {
        Payload::Identity => format!("*** connected as {source}"),
        Payload::Join => format!("*** {source} joined"),
        Payload::Quit => format!("*** {source} left"),
        Payload::Text(text) => format!("<{source}> {text}"),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
