use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::adapters::http::state::HttpState;
use crate::application::dto::{ConfigResponse, DetectResponse, ErrorResponse, OkResponse};

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(OkResponse { ok: true })
}

pub async fn get_config(State(st): State<HttpState>) -> impl IntoResponse {
    Json(ConfigResponse::new(st.counter.app_config(), st.counter.vehicle_config()))
}

/// Multipart upload with the picture in the `image` field.
pub async fn detect(State(st): State<HttpState>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("image") => match field.bytes().await {
                Ok(bytes) => {
                    upload = Some(bytes);
                    break;
                }
                Err(e) => return error(StatusCode::BAD_REQUEST, e.body_text()),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                warn!("Rejected upload: {}", e.body_text());
                return error(StatusCode::BAD_REQUEST, e.body_text());
            }
        }
    }

    let Some(bytes) = upload else {
        return error(StatusCode::BAD_REQUEST, "missing multipart field 'image'");
    };
    let outcome = st.counter.process(bytes.to_vec()).await;
    Json(DetectResponse::from(outcome)).into_response()
}

pub async fn run_example(State(st): State<HttpState>, Path(index): Path<usize>) -> Response {
    match st.counter.process_example(index).await {
        Some(outcome) => Json(DetectResponse::from(outcome)).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no example at index {index}")),
    }
}
