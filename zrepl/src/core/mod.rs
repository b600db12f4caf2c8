//!
//! core contains the command object, the volume bookkeeping and the
//! worker that executes commands against the block store.

mod io_cmd;
pub mod registry;
mod volume;
pub mod worker;

pub use io_cmd::IoCmd;
pub use volume::{
    RebuildInfo,
    RebuildState,
    Volume,
    VolumeState,
    VolumeStatus,
};
