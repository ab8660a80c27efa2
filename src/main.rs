use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
};

use clap::Parser;
use tracing::{error, info, level_filters::LevelFilter};

use camirror::{
    ServerBuilder,
    messages::EPICS_VERSION,
    providers::{MirrorBuilder, MirrorTarget},
};

#[derive(Parser)]
#[clap(about = "Serve local CA PVs that mirror PVs on another server")]
struct Options {
    /// Host name or address of the server that owns the PVs
    #[clap(long)]
    host: String,
    /// TCP port of the remote server
    #[clap(long, default_value_t = 5064)]
    port: u16,
    /// CA protocol version to declare to the remote server
    #[clap(long, default_value_t = EPICS_VERSION)]
    ca_version: u16,
    /// Prefix prepended to each remote name to form the local name
    #[clap(long, default_value = "mirror:")]
    prefix: String,
    /// Serve every mirror read-only, whatever the remote rights say
    #[clap(long)]
    read_only: bool,
    /// PV names to mirror
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn resolve_upstream(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let address = match resolve_upstream(&opts.host, opts.port) {
        Ok(address) => address,
        Err(e) => {
            error!("Cannot resolve upstream server {}: {e}", opts.host);
            std::process::exit(1);
        }
    };

    let mut builder = MirrorBuilder::default()
        .prefix(&opts.prefix)
        .force_read_only(opts.read_only);
    for name in &opts.names {
        builder =
            builder.add_target(MirrorTarget::new(name, address).protocol_version(opts.ca_version));
    }
    let provider = match builder.assemble().await {
        Ok(provider) => provider,
        Err(e) => {
            error!("Could not set up mirrors against {address}: {e}");
            std::process::exit(1);
        }
    };

    let server = ServerBuilder::new(provider)
        .start()
        .await
        .expect("failed to start CA server");
    info!(
        "Serving {} mirrored PVs on TCP port {}",
        opts.names.len(),
        server.connection_port()
    );

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for interrupt");
    info!("Interrupted, shutting down");
    server.stop().await.expect("server tasks failed");
}
