pub mod channel;
pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod model;
pub mod negotiate;
pub mod protocol;
pub mod transport;
pub mod version;

pub use client::{AccountClient, ClientConfig, Direction};
pub use command::{Command, CommandKind, CommandMessage, Reply, ReplyKind};
pub use connection::{Connection, Connector};
pub use error::ClientError;
pub use protocol::{Blame, ErrorCode, ErrorResponse, ProtocolIdentifier, RequestId, Response};
pub use version::ProtocolVersion;
