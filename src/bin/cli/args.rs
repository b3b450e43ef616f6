use clap::Parser;
use std::time::Duration;
use stomp_wire::{ConnectOptions, Heartbeat, parse_heartbeat_header};

#[derive(Parser, Debug)]
#[command(name = "stomp")]
#[command(version)]
#[command(about = "Interactive STOMP client CLI")]
pub struct Cli {
    /// STOMP broker address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:61613")]
    pub address: String,

    /// Login username
    #[arg(short, long, default_value = "guest")]
    pub login: String,

    /// Passcode
    #[arg(short, long, default_value = "guest")]
    pub passcode: String,

    /// Virtual host sent in the CONNECT `host` header
    #[arg(long, default_value = "/")]
    pub host: String,

    /// Heartbeat settings (client-send,client-receive in ms)
    #[arg(long, default_value = "10000,10000")]
    pub heartbeat: String,

    /// Seconds to wait for CONNECTED
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds to wait for RECEIPTs (unsubscribe, disconnect, --receipt sends)
    #[arg(long, default_value_t = 5)]
    pub receipt_timeout: u64,

    /// Ask the broker to confirm every `send`
    #[arg(long)]
    pub receipt: bool,

    /// Destinations to subscribe to (can be specified multiple times)
    #[arg(short, long)]
    pub subscribe: Vec<String>,

    /// Show session summary on exit
    #[arg(long)]
    pub summary: bool,
}

impl Cli {
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let (send_ms, receive_ms) = parse_heartbeat_header(&self.heartbeat);
        let clamp = |ms: u64| u32::try_from(ms).unwrap_or(u32::MAX);
        ConnectOptions::default()
            .login(&self.login)
            .passcode(&self.passcode)
            .host(&self.host)
            .heartbeat(Heartbeat::new(clamp(send_ms), clamp(receive_ms)))
            .connect_timeout(Duration::from_secs(self.connect_timeout))
            .unsubscribe_timeout(self.receipt_timeout())
    }
}
