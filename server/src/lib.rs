pub mod config;
pub mod connection;
mod connection_tx_storage;
pub mod dispatch;
pub mod registry;
pub mod rooms;
pub mod server;

pub use connection_tx_storage::ConnectionTx;
