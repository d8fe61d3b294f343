//! Dial and listen helpers over tarpc's JSON-over-TCP transport.

use std::{
    io,
    time::{Duration, Instant},
};

use tarpc::{client, context, serde_transport::tcp::connect, tokio_serde::formats::Json};

use crate::{MembershipClient, NodeClient};

/// Connections served concurrently per listener. Chains nest: a hop stays
/// connected while everything downstream of it runs, so this has to be large.
pub const MAX_CONNECTIONS: usize = 1024;

/// A request context whose deadline lies `deadline` from now.
pub fn context(deadline: Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = Instant::now() + deadline;
    ctx
}

pub async fn connect_node(address: &str) -> io::Result<NodeClient> {
    let mut transport = connect(address, Json::default);
    transport.config_mut().max_frame_length(usize::MAX);
    Ok(NodeClient::new(client::Config::default(), transport.await?).spawn())
}

pub async fn connect_membership(address: &str) -> io::Result<MembershipClient> {
    let mut transport = connect(address, Json::default);
    transport.config_mut().max_frame_length(usize::MAX);
    Ok(MembershipClient::new(client::Config::default(), transport.await?).spawn())
}

/// Serves every connection accepted by `listener` with one tarpc service.
///
/// ```ignore
/// let listener = listen(&addr, Json::default).await?;
/// let addr = listener.local_addr();
/// tokio::spawn(serve_incoming!(listener, Node::serve, server));
/// ```
///
/// Expands to a future; each request runs on its own task.
#[macro_export]
macro_rules! serve_incoming {
    ($listener:expr, $serve:path, $server:expr) => {{
        use ::futures::StreamExt as _;
        use ::tarpc::server::Channel as _;

        let mut listener = $listener;
        let server = $server;
        listener.config_mut().max_frame_length(usize::MAX);
        async move {
            listener
                .filter_map(|r| ::std::future::ready(r.ok()))
                .map(move |transport| {
                    ::tarpc::server::BaseChannel::with_defaults(transport)
                        .execute($serve(server.clone()))
                        .for_each(|future| async move {
                            ::tokio::spawn(future);
                        })
                })
                .buffer_unordered($crate::transport::MAX_CONNECTIONS)
                .for_each(|_| async {})
                .await
        }
    }};
}
