pub mod exchange;
pub mod fit;
pub mod forwarder;
pub mod handler;
pub mod reply;
pub mod server;

pub use exchange::{Exchanger, NetExchanger};
pub use forwarder::Forwarder;
pub use handler::RequestHandler;
pub use server::{DnsServer, Listener};

/// Largest DNS message the wire format can express (RFC 1035 §4.2.2 framing).
pub const MAX_MSG_SIZE: usize = 65535;
