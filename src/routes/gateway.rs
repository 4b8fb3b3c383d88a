use crate::server::Server;
use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::Response,
    routing::get,
};
use tracing::info;

pub fn create_gateway_routes() -> Router<Server> {
    Router::new().route("/ws", get(websocket_upgrade))
}

async fn websocket_upgrade(State(server): State<Server>, ws: WebSocketUpgrade) -> Response {
    info!(state = "connecting", "Gateway upgrade requested");
    let gateway = server.gateway.clone();
    ws.on_upgrade(move |socket| gateway.serve(socket))
}
