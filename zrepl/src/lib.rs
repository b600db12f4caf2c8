#[macro_use]
extern crate log;

pub mod checkpoint;
pub mod core;
pub mod logger;
pub mod protocol;
pub mod rebuild;
pub mod server;
pub mod store;
pub mod subsys;
