use foundations::telemetry::log;

mod config;
mod connection;
mod error;
mod interface;
mod kernel;
mod message;
mod nexthop;
mod redistribute;
mod rib;
mod router_id;
mod server;
mod show;
mod static_route;
mod table;
mod vrf;
mod zapi;

use config::Config;
use server::{spawn_dispatcher, Server};
use zapi::zserver_start;

#[tokio::main]
async fn main() {
    let config = Config::new();
    let srv = Server::new(config);
    let (_api, _kernel) = spawn_dispatcher(srv.clone());

    let listen = srv.config.listen.clone();
    match zserver_start(srv.clone(), listen, 0).await {
        Ok(zserver) => {
            log::info!("protocol server listening");
            *srv.vrfs.default_vrf().zserver.lock() = Some(zserver);
        }
        Err(e) => {
            log::error!("protocol server failed to start: {}", e);
            return;
        }
    }

    // All work happens in spawned tasks; park until interrupted.
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("signal wait failed: {}", e);
    }
    log::info!("shutting down");
}
