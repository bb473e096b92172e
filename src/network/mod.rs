// Network module - TCP server and MySQL client/server protocol

pub mod constants;
pub mod handshake;
pub mod packet;
pub mod prepared_statements;
pub mod response;
pub mod server;

pub use constants::Command;
pub use packet::{CommandEnvelope, PacketError, PacketReader};
pub use prepared_statements::{PreparedStatementCache, substitute_parameters};
pub use response::{Response, ResponseBuffer, ResultWriter};
pub use server::Server;
