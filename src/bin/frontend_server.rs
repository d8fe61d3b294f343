//! The frontend process: serves chains on one address and cluster
//! membership on another.

use clap::Parser;
use tarpc::{serde_transport::tcp::listen, tokio_serde::formats::Json};
use tracing::info;

use chainfs::{
    config::{self, Settings, DEFAULT_REPLICATION_FACTOR},
    frontend::FrontendServer,
    serve_incoming, Membership, Node,
};

#[derive(Parser, Debug)]
#[command(name = "frontend-server")]
struct Args {
    /// Address clients send their chains to.
    #[arg(long, default_value = "127.0.0.1:50000")]
    listen: String,

    /// Address backends join and heartbeat on.
    #[arg(long, default_value = "127.0.0.1:60000")]
    membership: String,

    /// Maximum number of active nodes per role.
    #[arg(long, default_value_t = DEFAULT_REPLICATION_FACTOR)]
    replication_factor: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::init_logging();
    config::log_chain_errors();
    let args = Args::parse();

    let server = FrontendServer::new(Settings::default().with_replication_factor(args.replication_factor));

    let chain_listener = listen(&args.listen, Json::default).await?;
    let membership_listener = listen(&args.membership, Json::default).await?;
    info!(
        chains = %chain_listener.local_addr(),
        membership = %membership_listener.local_addr(),
        replication_factor = args.replication_factor,
        "frontend up"
    );

    server.spawn_background();
    tokio::spawn(serve_incoming!(membership_listener, Membership::serve, server.clone()));
    serve_incoming!(chain_listener, Node::serve, server).await;

    Ok(())
}
