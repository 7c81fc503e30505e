//! TCP acceptor for the transfer protocol.
//!
//! Binds one listener and runs one [`Session`] task per accepted
//! connection. The acceptor owns nothing a session can break: a failed or
//! misbehaving connection is logged and finalized without disturbing the
//! listener or any other session.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::catalog::Catalog;
use crate::dlog;
use crate::logging::client_tag;
use crate::session::Session;
use crate::stats::Aggregator;

/// Everything a session needs, cloned into each connection task.
#[derive(Clone)]
pub struct ServerContext {
    pub catalog: Catalog,
    pub stats: Aggregator,
    /// Longest wait for the next command line before the session is dropped.
    pub idle_timeout: Duration,
    /// Longest stall while moving transfer bytes in either direction.
    pub transfer_timeout: Duration,
}

/// Accept connections until `shutdown` fires (or its sender is dropped).
pub async fn run(listener: TcpListener, ctx: ServerContext, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(handle_connection(stream, addr, ctx));
                }
                Err(e) => {
                    dlog!("transfer: accept failed: {e}");
                }
            },
        }
    }
}

/// One connection's lifetime: register, run the session, finalize. The
/// aggregator record is finalized exactly once on every close path.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ServerContext) {
    let client_id = ctx.stats.on_connect(&addr.ip().to_string());
    dlog!("transfer: {} connected from {addr}", client_tag(client_id));

    let mut session = Session::new(
        client_id,
        ctx.catalog,
        ctx.stats.clone(),
        ctx.idle_timeout,
        ctx.transfer_timeout,
    );
    match session.run(stream).await {
        Ok(()) => dlog!("transfer: {} disconnected", client_tag(client_id)),
        Err(e) => dlog!("transfer: {} closed: {e}", client_tag(client_id)),
    }

    ctx.stats.on_disconnect(client_id);
}
