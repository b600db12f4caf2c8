//! Replica data-plane server.
//!
//! Brings up the two listeners, the checkpoint timer and (optionally) an
//! in-memory demo volume. Volume records normally come from the
//! management channel, which lives outside this binary.

use std::process;
use std::sync::Arc;

#[macro_use]
extern crate log;

use byte_unit::Byte;
use nix::sys::signal::{signal, SigHandler, Signal};
use structopt::StructOpt;

use zrepl::checkpoint;
use zrepl::core::{registry, Volume};
use zrepl::logger;
use zrepl::server::Acceptor;
use zrepl::store::mem::MemStore;
use zrepl::subsys::Config;

fn parse_bytes(src: &str) -> Result<u64, String> {
    Byte::from_str(src)
        .map(|b| b.get_bytes() as u64)
        .map_err(|_| format!("invalid size {}", src))
}

#[derive(Debug, StructOpt)]
#[structopt(name = "zrepl", about = "User-space zvol replica data-plane engine")]
struct CliArgs {
    /// Port for client IO connections.
    #[structopt(short = "p", long = "io-port")]
    io_port: Option<u16>,
    /// Port for inbound rebuild connections.
    #[structopt(short = "r", long = "rebuild-port")]
    rebuild_port: Option<u16>,
    /// Size of one rebuild step range, e.g. "10 GiB".
    #[structopt(short = "s", long = "rebuild-step", parse(try_from_str = parse_bytes))]
    rebuild_step: Option<u64>,
    /// Path to a zrepl config YAML file.
    #[structopt(short = "y", long = "config")]
    config: Option<String>,
    /// Log level when RUST_LOG is not set.
    #[structopt(short = "l", long = "log-level", default_value = "info")]
    log_level: String,
    /// Create an in-memory volume with this name at startup.
    #[structopt(long = "mem-volume")]
    mem_volume: Option<String>,
    /// Size of the in-memory volume.
    #[structopt(long = "mem-volume-size", default_value = "1 GiB", parse(try_from_str = parse_bytes))]
    mem_volume_size: u64,
}

fn main() {
    let args = CliArgs::from_args();
    logger::init(&args.log_level);

    // responses are written to raw socket fds; a vanished peer must
    // surface as EPIPE, not kill the process
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        error!("failed to ignore SIGPIPE: {}", e);
        process::exit(1);
    }

    let config = Config::get_or_init(|| {
        let mut config = match &args.config {
            Some(path) => match Config::read(path) {
                Ok(config) => config,
                Err(e) => {
                    error!("{}", e);
                    process::exit(1);
                }
            },
            None => Config::default(),
        };
        if let Some(port) = args.io_port {
            config.io_port = port;
        }
        if let Some(port) = args.rebuild_port {
            config.rebuild_port = port;
        }
        if let Some(step) = args.rebuild_step {
            config.rebuild_step_size = step;
        }
        config
    });

    if let Some(name) = &args.mem_volume {
        let store = Arc::new(MemStore::new(args.mem_volume_size));
        let volume = Volume::new(name.clone(), store);
        if let Err(e) = registry::insert(volume) {
            error!("{}", e);
            process::exit(1);
        }
    }

    checkpoint::start();

    let acceptor = match Acceptor::bind(config.io_port, config.rebuild_port) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    // a replica without its listeners is not a replica; take the process
    // down so the orchestrator restarts it
    if let Err(e) = acceptor.run() {
        error!("connection acceptor failed: {}", e);
        process::exit(1);
    }
}
