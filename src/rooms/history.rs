use std::sync::Arc;

use axum::{Json, debug_handler, extract::{Path, Query, State}};
use serde::{Deserialize, Serialize};

use crate::{
    AppResult, AppState,
    config::Config,
    db::{Gateway, Message, RoomId, UserId},
};

use super::Registry;

const MAX_LIMIT: usize = 500;

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Presence {
    room_id: RoomId,
    user_ids: Vec<UserId>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    Path(room_id): Path<RoomId>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
    State(gateway): State<Arc<dyn Gateway>>,
    State(config): State<Arc<Config>>,
) -> AppResult<Json<Vec<Message>>> {
    let limit = limit.unwrap_or(config.history_limit).min(MAX_LIMIT);
    Ok(Json(gateway.get_messages_by_room(room_id, limit).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn presence(
    Path(room_id): Path<RoomId>,
    State(registry): State<Arc<Registry>>,
) -> Json<Presence> {
    Json(Presence { room_id, user_ids: registry.active_users(room_id) })
}
