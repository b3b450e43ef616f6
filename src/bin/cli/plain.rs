use futures::StreamExt;
use std::io::{self, BufRead, Write};
use stomp_wire::{AckMode, Connection, Frame, SendOptions};
use tokio::sync::mpsc;

use super::args::Cli;
use super::commands::{Command, parse_command, print_help};
use super::describe_error;
use super::state::{SharedState, new_shared_state};

/// Run the line-mode shell until `quit`, end of input or connection loss.
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    println!("Connecting to {}...", cli.address);
    let conn = Connection::connect(&cli.address, cli.connect_options())
        .await
        .map_err(|e| describe_error(&e, &cli.address))?;

    let (outgoing, incoming) = conn.heartbeat();
    println!(
        "Connected (STOMP {}, server {}).",
        conn.version().unwrap_or("?"),
        conn.server().unwrap_or("unknown")
    );
    tracing::debug!(?outgoing, ?incoming, "negotiated heartbeats");

    let state = new_shared_state(cli.address.clone(), cli.login.clone());
    for dest in &cli.subscribe {
        if let Err(msg) = subscribe_destination(&conn, dest, state.clone()).await {
            return Err((msg, super::exit_codes::PROTOCOL_ERROR));
        }
    }

    // Channel to receive user commands from stdin reader
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if cmd_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!();
    print_help();
    println!();

    loop {
        prompt();
        let line = tokio::select! {
            line = cmd_rx.recv() => line,
            closed = conn.closed() => {
                println!();
                return match closed {
                    Ok(()) => Ok(()),
                    Err(e) => Err(describe_error(&e, &cli.address)),
                };
            }
        };
        // end of input behaves like quit
        let line = line.unwrap_or_else(|| "quit".to_string());

        match parse_command(&line) {
            Ok(Command::Empty) => {}
            Ok(Command::Help) => print_help(),
            Ok(Command::Summary) => println!("{}", state.lock().await.generate_summary()),
            Ok(Command::Send { destination, body }) => {
                let mut options = SendOptions::default().content_type("text/plain");
                if cli.receipt {
                    options = options.receipt_timeout(cli.receipt_timeout());
                }
                match conn.send(&destination, body, options).await {
                    Ok(()) => state.lock().await.record_sent(),
                    Err(e) => eprintln!("Send error: {}", e),
                }
            }
            Ok(Command::Subscribe(dest)) => {
                if let Err(msg) = subscribe_destination(&conn, &dest, state.clone()).await {
                    eprintln!("{}", msg);
                }
            }
            Ok(Command::Unsubscribe(dest)) => {
                let id = state.lock().await.take_subscription(&dest);
                match id {
                    None => eprintln!("Not subscribed to {}", dest),
                    Some(id) => match conn.unsubscribe(&id, Some(cli.receipt_timeout())).await {
                        Ok(()) => println!("Unsubscribed from {}", dest),
                        Err(e) => eprintln!("Unsubscribed from {} locally: {}", dest, e),
                    },
                }
            }
            Ok(Command::Quit) => {
                println!("Disconnecting...");
                if cli.summary {
                    println!("{}", state.lock().await.generate_summary());
                }
                return conn
                    .disconnect(Some(cli.receipt_timeout()))
                    .await
                    .map_err(|e| describe_error(&e, &cli.address));
            }
            Err(msg) => eprintln!("{}", msg),
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

/// Subscribe to `dest` and print its messages from a background task.
async fn subscribe_destination(
    conn: &Connection,
    dest: &str,
    state: SharedState,
) -> Result<(), String> {
    let mut sub = conn
        .subscribe(dest, AckMode::Auto)
        .await
        .map_err(|e| format!("Failed to subscribe to '{}': {}", dest, e))?;
    println!("Subscribed to: {} (id {})", dest, sub.id());
    state.lock().await.register_subscription(dest, sub.id());

    let dest = dest.to_string();
    tokio::spawn(async move {
        while let Some(frame) = sub.next().await {
            state.lock().await.record_message(&dest);
            print_message(&dest, &frame);
        }
        tracing::debug!(destination = %dest, "subscription stream ended");
    });
    Ok(())
}

fn print_message(dest: &str, frame: &Frame) {
    println!("\n[{}] MESSAGE received:", dest);
    for (k, v) in &frame.headers {
        println!("  {}: {}", k, v);
    }
    if !frame.body.is_empty() {
        match frame.body_str() {
            Some(s) => println!("  Body: {}", s),
            None => println!("  Body: ({} bytes, binary)", frame.body.len()),
        }
    }
    prompt();
}
