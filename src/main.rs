//! depot: one process serving the TCP transfer protocol and the HTTP API
//! over the same catalog and statistics stores.

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use depot::catalog::Catalog;
use depot::config::{Cli, Config};
use depot::dlog;
use depot::logging;
use depot::server::{self, ServerContext};
use depot::stats::Aggregator;
use depot::web::router::build_router;
use depot::web::AppState;

#[tokio::main]
async fn main() {
    logging::init();
    let config = Config::from_cli_and_env(Cli::parse());

    std::fs::create_dir_all(&config.data_dir).expect("failed to create data directory");
    let catalog = Catalog::open(&config.storage_dir(), &config.catalog_path())
        .expect("failed to open file catalog");
    let stats = Aggregator::open(&config.stats_path(), config.history_cap)
        .expect("failed to open network statistics");

    dlog!("depot: data dir {}", config.data_dir.display());

    let ctx = ServerContext {
        catalog: catalog.clone(),
        stats,
        idle_timeout: config.idle_timeout,
        transfer_timeout: config.transfer_timeout,
    };
    let tcp_listener = TcpListener::bind(&config.tcp_bind)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.tcp_bind));
    dlog!("transfer: listening on {}", config.tcp_bind);

    // The sender is held for the life of main so the acceptor never sees a
    // dropped channel.
    let (_tcp_shutdown, tcp_shutdown_rx) = oneshot::channel();
    tokio::spawn(server::run(tcp_listener, ctx, tcp_shutdown_rx));

    let app = build_router(AppState { catalog });
    let http_listener = TcpListener::bind(&config.http_bind)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.http_bind));
    dlog!("web: listening on {}", config.http_bind);

    axum::serve(http_listener, app)
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));
}
