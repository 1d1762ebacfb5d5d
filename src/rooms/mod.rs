mod history;
mod msg;
mod registry;
mod session;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use registry::{Connection, Frame, GenerationGuard, Membership, Outbox, Registry, is_current};
pub use session::{JoinSnapshot, Session};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
        .route("/rooms/{room_id}/messages", get(history::messages))
        .route("/rooms/{room_id}/presence", get(history::presence))
}
