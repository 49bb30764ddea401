use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use anonchat_shared::errors::AppResult;
use anonchat_shared::types::api::ApiResponse;

use crate::AppState;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub waiting_users: u64,
    pub active_sessions: u64,
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<ApiResponse<PoolStats>>> {
    let engine = state.dispatcher.engine();
    let stats = PoolStats {
        waiting_users: engine.pool.len().await?,
        active_sessions: engine.sessions.active_count().await?,
    };
    Ok(Json(ApiResponse::ok(stats)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{app_state, user};

    #[tokio::test]
    async fn counts_waiting_and_paired_users() {
        let state = app_state();
        let engine = state.dispatcher.engine();
        for n in 1..=3 {
            engine.request_match(user(n)).await.unwrap();
        }

        let Json(body) = get_stats(State(state.clone())).await.unwrap();

        assert!(body.success);
        assert_eq!(body.data, PoolStats { waiting_users: 1, active_sessions: 1 });
    }
}
