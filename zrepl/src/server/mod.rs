//!
//! Socket-facing side of the data plane: the two-listener connection
//! acceptor, the per-connection client receiver and the per-volume ack
//! sender that writes completions back out.

pub mod ack;
pub mod acceptor;
pub mod receiver;

pub use acceptor::Acceptor;
