//! An auth replica.

use clap::Parser;
use tarpc::{serde_transport::tcp::listen, tokio_serde::formats::Json};
use tracing::info;

use chainfs::{
    auth::AuthServer,
    chain::Role,
    config::{self, Settings, STATE_DUMP_INTERVAL},
    heartbeat,
    registry::NodeDescriptor,
    serve_incoming, Node,
};

#[derive(Parser, Debug)]
#[command(name = "auth-server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: String,

    /// The frontend's membership address.
    #[arg(long, default_value = "127.0.0.1:60000")]
    frontend: String,

    /// Fixed slot id. Without one the frontend hands out a fresh slot.
    #[arg(long)]
    slot: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::init_logging();
    config::log_chain_errors();
    let args = Args::parse();
    let settings = Settings::default();

    let listener = listen(&args.listen, Json::default).await?;
    let address = listener.local_addr().to_string();
    let slot = match args.slot {
        Some(slot) => slot,
        None => heartbeat::join(&args.frontend, Role::Auth, &address, settings.rpc_deadline).await?,
    };
    info!(%address, slot, "auth up");

    let server = AuthServer::new(NodeDescriptor::new(slot, Role::Auth, address), settings.clone());
    tokio::spawn(heartbeat::run(
        server.clone(),
        args.frontend,
        settings.heartbeat_interval,
        settings.rpc_deadline,
    ));
    let dump = server.clone();
    heartbeat::spawn_state_dump(STATE_DUMP_INTERVAL, move || dump.describe());

    serve_incoming!(listener, Node::serve, server).await;

    Ok(())
}
