pub mod codec;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod parser;
mod receipt;
pub mod subscription;

pub use codec::{CodecError, StompCodec, StompItem};
pub use connection::{ConnState, ConnectOptions, Connection, SendOptions};
pub use error::{ConnError, ServerError};
pub use frame::{Command, Frame};
pub use heartbeat::{Heartbeat, negotiate_heartbeats, parse_heartbeat_header};
pub use subscription::{AckMode, MessageHandler, Subscription, SubscriptionOptions};
