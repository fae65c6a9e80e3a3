//! Interactive Chat Roulette Client
//!
//! Line-based terminal client: waits for a partner, relays typed lines,
//! and exposes next/stop/stats commands.

use anyhow::Result;
use clap::Parser;
use log::{debug, error};
use serde_json::json;
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;

use chat_roulette::protocol::{read_message, write_message};
use chat_roulette::{tls, ClientConfig, SignalingMessage};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "roulette-client")]
#[command(about = "Chat Roulette Interactive Client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        ClientConfig::from_file(&args.config)?
    } else {
        ClientConfig::default()
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level))
        .init();

    let host = args.host.unwrap_or_else(|| config.server_host.clone());
    let port = args.port.unwrap_or(config.port);

    println!("Connecting to {}:{} ...", host, port);
    let stream = TcpStream::connect((host.as_str(), port)).await?;

    let stream: Box<dyn Transport> = match &config.ca_certfile {
        Some(ca) => {
            let connector = tls::connector(ca)?;
            let name = config.server_name.clone().unwrap_or_else(|| host.clone());
            let server_name = ServerName::try_from(name)?;
            Box::new(connector.connect(server_name, stream).await?)
        }
        None => Box::new(stream),
    };

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let max_frame_bytes = config.max_frame_bytes;

    let mut server_task = tokio::spawn(async move {
        let mut requeue = false;
        loop {
            match read_message(&mut read_half, max_frame_bytes).await {
                Ok(Some(message)) => {
                    if let SignalingMessage::Welcome {
                        requeue_on_partner_left,
                        ..
                    } = &message
                    {
                        requeue = *requeue_on_partner_left;
                    }
                    print_event(&message, requeue);
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    break;
                }
            }
        }
    });

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
    let input_task = tokio::spawn(handle_user_input(cmd_tx));

    println!("Commands:");
    println!("  next   - skip to a new partner");
    println!("  stop   - leave the queue (type next to rejoin)");
    println!("  stats  - show online count");
    println!("  quit   - exit");
    println!("Anything else is sent to your partner.");
    println!();

    loop {
        tokio::select! {
            line = cmd_rx.recv() => {
                // stdin closed
                let Some(line) = line else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let request = match line {
                    "next" => SignalingMessage::Next,
                    "stop" => SignalingMessage::Stop,
                    "stats" => SignalingMessage::Stats,
                    "quit" | "exit" => break,
                    text => SignalingMessage::Send { payload: json!({ "text": text }) },
                };
                debug!("Sending {:?}", request);
                write_message(&mut write_half, &request).await?;
            }
            _ = &mut server_task => {
                println!("Server connection lost");
                break;
            }
        }
    }

    input_task.abort();
    Ok(())
}

fn print_event(message: &SignalingMessage, requeue: bool) {
    match message {
        SignalingMessage::Welcome { connection_id, .. } => {
            println!("Connected as {}. Looking for a partner...", connection_id)
        }
        SignalingMessage::Paired { partner_id } => {
            println!("Paired with {}. Say hi!", partner_id)
        }
        SignalingMessage::PartnerLeft => println!("{}", partner_left_notice(requeue)),
        SignalingMessage::Message { payload } => match payload.get("text").and_then(|t| t.as_str()) {
            Some(text) => println!("partner: {}", text),
            None => println!("partner sent: {}", payload),
        },
        SignalingMessage::StatsReport {
            online,
            waiting,
            pairs,
        } => println!("{} online, {} waiting, {} chatting in pairs", online, waiting, pairs),
        SignalingMessage::Error { message } => println!("Server error: {}", message),
        other => println!("Received: {:?}", other),
    }
    print!("> ");
    let _ = io::stdout().flush();
}

/// What to tell the user when the server reports that their partner left
fn partner_left_notice(requeue: bool) -> &'static str {
    if requeue {
        "Your partner left. Looking for someone new..."
    } else {
        "Your partner left. Type next to find someone new."
    }
}

async fn handle_user_input(cmd_tx: mpsc::UnboundedSender<String>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if cmd_tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}
