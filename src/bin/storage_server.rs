//! A storage replica of either variant.

use clap::{Parser, ValueEnum};
use tarpc::{serde_transport::tcp::listen, tokio_serde::formats::Json};
use tracing::info;

use chainfs::{
    chain::StorageVariant,
    config::{self, Settings, STATE_DUMP_INTERVAL},
    heartbeat,
    registry::NodeDescriptor,
    serve_incoming,
    storage::StorageServer,
    Node,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Variant {
    /// Files stored with a secret.
    A,
    /// Files stored without one.
    B,
}

impl From<Variant> for StorageVariant {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::A => StorageVariant::A,
            Variant::B => StorageVariant::B,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "storage-server")]
struct Args {
    #[arg(long, value_enum)]
    variant: Variant,

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
    let variant = StorageVariant::from(args.variant);
    let role = variant.role();

    let listener = listen(&args.listen, Json::default).await?;
    let address = listener.local_addr().to_string();
    let slot = match args.slot {
        Some(slot) => slot,
        None => heartbeat::join(&args.frontend, role, &address, settings.rpc_deadline).await?,
    };
    info!(%address, slot, %role, "storage up");

    let server = StorageServer::new(variant, NodeDescriptor::new(slot, role, address), settings.clone());
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
