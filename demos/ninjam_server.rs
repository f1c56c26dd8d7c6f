use clap::Parser;
use ninjam_rust::{
    common::box_error::BoxError,
    server::broadcast_server::{self, Overrides},
};
use std::path::PathBuf;

/// Host a jam server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Server config file
    #[arg(short, long, default_value = "server.json")]
    config: String,

    /// Listen on this port instead of the configured one
    #[arg(short, long)]
    port: Option<u16>,

    /// Archive sessions under this directory
    #[arg(short, long)]
    archive: Option<PathBuf>,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();
    broadcast_server::run(
        &args.config,
        Overrides {
            port: args.port,
            log_path: args.archive,
        },
    )?;
    Ok(())
}
