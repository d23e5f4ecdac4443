//! Interactive command parsing
//!
//! ```text
//! /connect <port>           pair with a node on this host
//! /connect <host> <port>    pair with a remote node
//! /peers                    list connected peers
//! /stats                    show channel and buffer counters
//! /quit                     leave
//! anything else             chat message
//! ```

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, port: u16 },
    Peers,
    Stats,
    Quit,
    Text(String),
    /// Unrecognised `/command`
    Unknown(String),
    /// Recognised command with bad arguments; carries the usage hint
    Invalid(&'static str),
}

const CONNECT_USAGE: &str = "Usage: /connect <port> or /connect <host> <port>";

fn parse_port(text: &str) -> Option<u16> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Parse one input line. Returns `None` for blank lines.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if !line.starts_with('/') {
        return Some(Command::Text(line.to_string()));
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let parsed = match command {
        "/connect" => match args.as_slice() {
            [port] => parse_port(port).map(|port| Command::Connect {
                host: "localhost".to_string(),
                port,
            }),
            [host, port] => parse_port(port).map(|port| Command::Connect {
                host: host.to_string(),
                port,
            }),
            _ => None,
        }
        .unwrap_or(Command::Invalid(CONNECT_USAGE)),
        "/peers" if args.is_empty() => Command::Peers,
        "/stats" if args.is_empty() => Command::Stats,
        "/quit" | "/exit" if args.is_empty() => Command::Quit,
        other => Command::Unknown(other.to_string()),
    };

    Some(parsed)
}
