use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use http::{header, StatusCode};
use serde::Deserialize;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::route::AppState;
use crate::AppError;

pub fn route() -> Router<AppState> {
    Router::new().route("/offer", post(offer))
}

#[derive(Debug, Default, Deserialize)]
struct OfferParams {
    fname: Option<String>,
}

/// One-shot signaling exchange: JSON offer in, JSON answer out. Everything
/// after the answer is best effort and never reported back to the caller.
async fn offer(
    State(state): State<AppState>,
    Query(params): Query<OfferParams>,
    body: String,
) -> crate::result::Result<Response<String>> {
    let offer: RTCSessionDescription = serde_json::from_str(&body)
        .map_err(|err| AppError::bad_request(format!("error decoding offer: {err}")))?;

    let hint = params
        .fname
        .filter(|f| acceptable_hint(f, state.config.record.max_fname_len));

    let (answer, session) = state.sessions.create(offer, hint).await?;
    let body = match serde_json::to_string(&answer) {
        Ok(body) => body,
        Err(err) => {
            state.sessions.discard(&session).await;
            return Err(AppError::InternalServerError(err.into()));
        }
    };
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)?)
}

/// A hint is taken only when it cannot influence the path: short enough and
/// strictly alphanumeric.
fn acceptable_hint(hint: &str, max_len: usize) -> bool {
    !hint.is_empty() && hint.len() < max_len && hint.bytes().all(|b| b.is_ascii_alphanumeric())
}
