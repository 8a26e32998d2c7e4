use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[Handler] = &[
    handlers::core::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::subjects::try_handle,
    handlers::results::try_handle,
    handlers::reports::try_handle,
    handlers::setup::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let span = tracing::debug_span!("request", id = %req.id, method = %req.method);
    let _enter = span.enter();

    for handler in HANDLERS {
        if let Some(resp) = handler(state, &req) {
            log_outcome(&resp);
            return resp;
        }
    }

    tracing::warn!("unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

fn log_outcome(resp: &serde_json::Value) {
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        tracing::debug!("ok");
        return;
    }
    let code = resp
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let message = resp
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    tracing::warn!(code, message, "request failed");
}
