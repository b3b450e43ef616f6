/// A parsed shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { destination: String, body: String },
    Subscribe(String),
    Unsubscribe(String),
    Summary,
    Help,
    Quit,
    Empty,
}

/// Parse one input line.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.trim().splitn(3, ' ').collect();
    let Some(&name) = parts.first().filter(|p| !p.is_empty()) else {
        return Ok(Command::Empty);
    };

    match name {
        "quit" | "exit" | "q" => Ok(Command::Quit),
        "help" | "?" => Ok(Command::Help),
        "summary" => Ok(Command::Summary),
        "send" => match (parts.get(1), parts.get(2)) {
            (Some(dest), Some(body)) => Ok(Command::Send {
                destination: dest.to_string(),
                body: body.to_string(),
            }),
            _ => Err("Usage: send <destination> <message>".to_string()),
        },
        "sub" | "subscribe" => parts
            .get(1)
            .map(|d| Command::Subscribe(d.to_string()))
            .ok_or_else(|| "Usage: sub <destination>".to_string()),
        "unsub" | "unsubscribe" => parts
            .get(1)
            .map(|d| Command::Unsubscribe(d.to_string()))
            .ok_or_else(|| "Usage: unsub <destination>".to_string()),
        other => Err(format!(
            "Unknown command: {}. Type 'help' for commands.",
            other
        )),
    }
}

/// Print help text
pub fn print_help() {
    println!("Commands:");
    println!("  send <destination> <message>  - Send a message");
    println!("  sub <destination>             - Subscribe to a destination");
    println!("  unsub <destination>           - Unsubscribe from a destination");
    println!("  summary                       - Print session summary");
    println!("  quit                          - Disconnect and exit");
}
