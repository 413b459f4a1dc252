// src/main.rs

mod relay_ws;
use dotenv::dotenv;
use std::error::Error;
use log::{info, error, warn};
use warp::Filter;
use ws_relay_lib::{Dispatcher, RelayConfig};

/* RUST_LOG=ws_relay_lib=debug,ws_relay_server=info \
cargo run -p ws_relay-server */

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    // ──────── ① Optional .env, then logger and panic hook ────────
    let dotenv_result = dotenv();

    env_logger::init();
    std::panic::set_hook(Box::new(|info| {
        error!("Thread panic: {:?}", info);
    }));

    if let Err(e) = dotenv_result {
        info!("No .env loaded ({}), using process environment", e);
    }

    // ──────── ② RELAY_* settings ────────
    let config = RelayConfig::from_env()?;
    info!(
        "Dispatch: echo_to_sender={}, read_errors={:?}, max_concurrent_writes={:?}",
        config.dispatch.echo_to_sender,
        config.dispatch.read_errors,
        config.dispatch.max_concurrent_writes,
    );

    // shared registry + broadcaster, cloned into every route
    let dispatcher = Dispatcher::new(config.dispatch.clone());

    let routes = relay_ws::ws_routes(config.path.clone(), dispatcher.clone())
        .or(relay_ws::health_route(dispatcher.clone()));

    // ──────── ③ Serve until Ctrl-C ────────
    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(config.listen, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })?;

    info!("WebSocket : ws://{}/{}", addr, config.path);
    info!("HTTP      : http://{}/health", addr);

    server.await;

    let remaining = dispatcher.registry().len();
    if remaining > 0 {
        info!("Stopped with {} client(s) still connected", remaining);
    }
    Ok(())
}
