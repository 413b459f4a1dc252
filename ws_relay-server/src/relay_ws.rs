use std::convert::Infallible;
use std::net::SocketAddr;
use futures_util::{SinkExt, StreamExt, future};
use serde::Serialize;
use warp::{Filter, Rejection, Reply, ws::{Message as WsMsg, WebSocket}};
use ws_relay_lib::{ConnectionInfo, Disconnect, Dispatcher, Payload, TransportError};
use log::debug;

/// Cloneable filter handing the dispatcher to every request
fn with_dispatcher(
    dispatcher: Dispatcher,
) -> impl Filter<Extract = (Dispatcher,), Error = Infallible> + Clone {
    warp::any().map(move || dispatcher.clone())
}

/// Build the WebSocket relay route under `/<path>`
pub fn ws_routes(
    path: String,
    dispatcher: Dispatcher,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    // allow CORS for WS handshake
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "OPTIONS"])
        .allow_headers(vec!["sec-websocket-protocol", "origin", "upgrade"]);

    warp::path(path)
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::addr::remote())
        .and(with_dispatcher(dispatcher))
        .map(|ws: warp::ws::Ws, peer: Option<SocketAddr>, dispatcher: Dispatcher| {
            ws.on_upgrade(move |socket| handle_ws(socket, peer, dispatcher))
        })
        .with(cors)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
    clients: Vec<ConnectionInfo>,
}

/// `GET /health` → registry summary as JSON
pub fn health_route(
    dispatcher: Dispatcher,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .and(with_dispatcher(dispatcher))
        .map(|dispatcher: Dispatcher| {
            let clients: Vec<ConnectionInfo> = dispatcher
                .registry()
                .snapshot()
                .iter()
                .map(|conn| conn.info())
                .collect();
            warp::reply::json(&Health {
                status: "ok",
                connections: clients.len(),
                clients,
            })
        })
}

async fn handle_ws(ws: WebSocket, peer: Option<SocketAddr>, dispatcher: Dispatcher) {
    let (ws_tx, ws_rx) = ws.split();

    // Relay → client: payloads go back out as the same frame kind
    let outbound = ws_tx
        .sink_map_err(|e| TransportError::Write(e.to_string()))
        .with(|payload: Payload| future::ok::<_, TransportError>(encode(payload)));

    // Client → relay: control frames other than close never reach the dispatcher
    let inbound = ws_rx.filter_map(|frame| future::ready(decode(frame)));

    match dispatcher.serve(peer, outbound, inbound).await {
        Disconnect::Closed => debug!("WebSocket closed cleanly"),
        Disconnect::ReadError(e) => debug!("WebSocket dropped after read error: {}", e),
    }
}

fn decode(frame: Result<WsMsg, warp::Error>) -> Option<Result<Payload, TransportError>> {
    match frame {
        Ok(msg) if msg.is_close() => Some(Err(TransportError::ConnectionClosed)),
        Ok(msg) if msg.is_binary() => Some(Ok(Payload::Binary(msg.into_bytes()))),
        Ok(msg) => match msg.to_str() {
            Ok(text) => Some(Ok(Payload::Text(text.to_owned()))),
            Err(()) => None, // ping / pong
        },
        Err(e) => Some(Err(TransportError::Connection(e.to_string()))),
    }
}

fn encode(payload: Payload) -> WsMsg {
    match payload {
        Payload::Text(text) => WsMsg::text(text),
        Payload::Binary(bytes) => WsMsg::binary(bytes),
    }
}
