//! Socket.IO adapter: authenticates clients, turns `message` events into
//! dispatcher calls and renders outbound messages into `notice` / `message`
//! events on the user's room.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socketioxide::extract::{Data, SocketRef, State};
use socketioxide::SocketIo;
use uuid::Uuid;

use anonchat_shared::types::auth::validate_token;

use super::{DeliveryError, Gateway, Localizer, Outbound, REPORT_PROMPT_KEY, REPORT_REASONS_KEY};
use crate::models::UserId;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct NoticePayload {
    pub key: &'static str,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct MessagePayload<'a> {
    pub text: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Client language sent as `?lang=` on connect.
#[derive(Debug, Clone)]
struct ClientLanguage(String);

pub fn user_room(user: UserId) -> String {
    format!("user:{user}")
}

/// Delivers through the Socket.IO layer. The layer is built after the app
/// state, so the handle is attached once at startup.
///
/// Rooms live in this process, and the instance lease keeps this process the
/// only server for its store. An empty room therefore means the user has no
/// connection at all and is reported as [`DeliveryError::Unreachable`].
pub struct SocketGateway {
    io: OnceLock<SocketIo>,
    localizer: Arc<Localizer>,
}

impl SocketGateway {
    pub fn new(localizer: Arc<Localizer>) -> Self {
        Self {
            io: OnceLock::new(),
            localizer,
        }
    }

    pub fn attach(&self, io: SocketIo) {
        if self.io.set(io).is_err() {
            tracing::warn!("socket layer already attached");
        }
    }
}

#[async_trait]
impl Gateway for SocketGateway {
    async fn deliver(&self, message: &Outbound, language: &str) -> Result<(), DeliveryError> {
        let io = self
            .io
            .get()
            .ok_or_else(|| DeliveryError::Transient("socket layer not attached".into()))?;

        let to = message.recipient();
        let room = user_room(to);
        let connected = io
            .to(room.clone())
            .sockets()
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;
        if connected.is_empty() {
            return Err(DeliveryError::Unreachable(to));
        }

        let result = match message {
            Outbound::Notice { key, params, .. } => io.to(room).emit(
                "notice",
                &NoticePayload {
                    key: key.as_str(),
                    text: self.localizer.text(language, key.as_str(), params),
                    options: None,
                },
            ),
            Outbound::Forward { text, .. } => io.to(room).emit("message", &MessagePayload { text }),
            Outbound::ReportMenu { .. } => io.to(room).emit(
                "notice",
                &NoticePayload {
                    key: REPORT_PROMPT_KEY,
                    text: self.localizer.text(language, REPORT_PROMPT_KEY, &[]),
                    options: Some(self.localizer.options(language, REPORT_REASONS_KEY)),
                },
            ),
        };

        result.map_err(|e| DeliveryError::Transient(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

pub async fn on_connect(socket: SocketRef, state: State<Arc<AppState>>) {
    let user_id = match authenticate_socket(&socket, &state.config.jwt_secret) {
        Ok(id) => id,
        Err(msg) => {
            tracing::warn!(error = %msg, "socket auth failed");
            let _ = socket.emit(
                "error",
                &ErrorPayload {
                    code: "AUTH_FAILED".into(),
                    message: msg,
                },
            );
            socket.disconnect().ok();
            return;
        }
    };

    socket.extensions.insert(user_id);
    if let Some(lang) = query_param(&socket, "lang") {
        socket.extensions.insert(ClientLanguage(lang));
    }

    // Handlers first: the client may emit as soon as it gets the connect ack.
    socket.on("message", on_message);
    socket.on_disconnect(on_disconnect);

    socket.join(user_room(user_id)).ok();

    tracing::info!(user_id = %user_id, sid = %socket.id, "socket connected");
}

async fn on_message(socket: SocketRef, state: State<Arc<AppState>>, Data(payload): Data<InboundMessage>) {
    let Some(user_id) = get_user_id(&socket) else {
        return;
    };
    let language = socket.extensions.get::<ClientLanguage>().map(|l| l.0);

    if let Err(e) = state
        .dispatcher
        .handle(user_id, &payload.text, language.as_deref())
        .await
    {
        tracing::error!(user_id = %user_id, code = e.code().code(), error = %e, "message handling failed");
        let _ = socket.emit(
            "error",
            &ErrorPayload {
                code: e.code().code().into(),
                message: e.to_string(),
            },
        );
    }
}

async fn on_disconnect(socket: SocketRef, state: State<Arc<AppState>>) {
    let Some(user_id) = get_user_id(&socket) else {
        return;
    };

    // Another tab or device keeps the user reachable.
    let others = socket
        .to(user_room(user_id))
        .sockets()
        .map(|s| s.len())
        .unwrap_or(0);
    if others > 0 {
        tracing::debug!(user_id = %user_id, sid = %socket.id, others, "socket closed, user still connected");
        return;
    }

    tracing::info!(user_id = %user_id, sid = %socket.id, "socket disconnected");
    if let Err(e) = state.dispatcher.engine().disconnect(user_id).await {
        tracing::error!(user_id = %user_id, error = %e, "disconnect cleanup failed");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_param(socket: &SocketRef, name: &str) -> Option<String> {
    let query = socket.req_parts().uri.query()?;
    query.split('&').find_map(|pair| {
        let mut split = pair.splitn(2, '=');
        let key = split.next()?;
        let value = split.next()?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

fn authenticate_socket(socket: &SocketRef, secret: &str) -> Result<Uuid, String> {
    let token = query_param(socket, "token").ok_or_else(|| "missing token query parameter".to_string())?;
    let claims = validate_token(&token, secret).map_err(|e| e.to_string())?;
    Ok(claims.sub)
}

fn get_user_id(socket: &SocketRef) -> Option<Uuid> {
    socket.extensions.get::<Uuid>()
}
