pub mod args;
pub mod commands;
pub mod plain;
pub mod state;

use stomp_wire::ConnError;

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Successful execution
    pub const SUCCESS: u8 = 0;
    /// Network/connection error (e.g., host unreachable, connection refused)
    pub const NETWORK_ERROR: u8 = 1;
    /// Authentication error (e.g., invalid credentials)
    pub const AUTH_ERROR: u8 = 2;
    /// Protocol error (e.g., unexpected server response)
    pub const PROTOCOL_ERROR: u8 = 3;
}

/// A user-facing message and the exit code for a connection error.
pub fn describe_error(err: &ConnError, address: &str) -> (String, u8) {
    match err {
        ConnError::ConnectFailed(cause) => match cause.as_ref() {
            ConnError::ServerError(server_err) => {
                let mut message = format!("Authentication failed: {}", server_err.message);
                if let Some(body) = &server_err.body {
                    message.push_str(&format!(" ({})", body.trim_end()));
                }
                (message, exit_codes::AUTH_ERROR)
            }
            other => describe_error(other, address),
        },
        ConnError::Io(io_err) => {
            let message = match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    format!("Connection refused: {}", address)
                }
                std::io::ErrorKind::TimedOut => format!("Connection timed out: {}", address),
                std::io::ErrorKind::UnexpectedEof => {
                    format!("Connection closed by broker: {}", address)
                }
                _ => format!("Connection failed: {}", io_err),
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        ConnError::ConnectTimeout(d) => (
            format!("No CONNECTED frame from {} within {:?}", address, d),
            exit_codes::NETWORK_ERROR,
        ),
        ConnError::HeartbeatTimeout(d) => (
            format!("Broker {} went silent for {:?}", address, d),
            exit_codes::NETWORK_ERROR,
        ),
        ConnError::ServerError(server_err) => {
            (format!("Broker error: {}", server_err), exit_codes::PROTOCOL_ERROR)
        }
        other => (format!("Protocol error: {}", other), exit_codes::PROTOCOL_ERROR),
    }
}
