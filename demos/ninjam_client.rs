use clap::Parser;
use ninjam_rust::{
    common::box_error::BoxError,
    sound::client::{self, ClientOptions},
};

/// Join a jam server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Server as host or host:port
    host: String,

    /// User name, prefix with "anonymous:" for anonymous login
    #[arg(short, long, default_value = "anonymous")]
    user: String,

    /// Password
    #[arg(short, long, default_value = "")]
    password: String,

    /// Client config file
    #[arg(short, long)]
    config: Option<String>,

    /// Name of the local channel
    #[arg(long, default_value = "channel")]
    channel: String,

    /// Agree to the server license without asking
    #[arg(long)]
    accept_license: bool,

    /// Run without a sound card
    #[arg(long)]
    no_jack: bool,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();
    client::run(ClientOptions {
        host: args.host,
        user: args.user,
        pass: args.password,
        config_file: args.config,
        use_jack: !args.no_jack,
        accept_license: args.accept_license,
        channel_name: args.channel,
    })?;
    Ok(())
}
