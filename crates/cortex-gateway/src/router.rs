use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use cortex_agents::brain::Response as RunOutcome;
use cortex_agents::Brain;
use cortex_common::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::parse;

pub const HEADER_RUN_DURATION: &str = "x-run-duration";
pub const HEADER_RUN_INPUT_TOKENS: &str = "x-run-input-tokens";
pub const HEADER_RUN_OUTPUT_TOKENS: &str = "x-run-output-tokens";
pub const HEADER_RUN_TOTAL_TOKENS: &str = "x-run-total-tokens";
pub const HEADER_RUN_CONTEXT: &str = "x-run-context";

#[derive(Clone)]
pub struct AppState {
    pub brain: Arc<Brain>,
    /// Per-request engine deadline.
    pub timeout: Duration,
    /// Request body cap in bytes.
    pub max_body: usize,
}

/// Build the public HTTP surface:
/// `POST /` stateless run, `POST /{thread}` chat, `PUT /{thread}` append,
/// `GET /ready` readiness.
pub fn build_router(state: AppState) -> Router {
    let max_body = state.max_body;
    Router::new()
        .route("/ready", get(ready))
        .route("/", post(run))
        .route("/{thread}", post(chat).put(append))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ready() -> StatusCode {
    StatusCode::OK
}

async fn run(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let messages = match parse::parse_request(request, state.max_body).await {
        Ok(messages) => messages,
        Err(e) => return error_response(&e),
    };
    let context = messages.len();

    match tokio::time::timeout(state.timeout, state.brain.run(messages, "")).await {
        Err(_) => deadline_response(),
        Ok(Err(e)) => engine_error_response(&e.source),
        Ok(Ok(outcome)) => reply_response(&outcome, context, started),
    }
}

async fn chat(
    State(state): State<AppState>,
    Path(thread): Path<String>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let messages = match parse::parse_request(request, state.max_body).await {
        Ok(messages) => messages,
        Err(e) => return error_response(&e),
    };
    let context = messages.len();

    match tokio::time::timeout(state.timeout, state.brain.chat(&thread, messages)).await {
        Err(_) => deadline_response(),
        Ok(Err(e)) => engine_error_response(&e.source),
        Ok(Ok(outcome)) => reply_response(&outcome, context, started),
    }
}

async fn append(
    State(state): State<AppState>,
    Path(thread): Path<String>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let messages = match parse::parse_request(request, state.max_body).await {
        Ok(messages) => messages,
        Err(e) => return error_response(&e),
    };
    let context = messages.len();

    match tokio::time::timeout(state.timeout, state.brain.append(&thread, messages)).await {
        Err(_) => deadline_response(),
        Ok(Err(e)) => engine_error_response(&e.source),
        Ok(Ok(outcome)) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            run_headers(response.headers_mut(), &outcome, context, started);
            response
        }
    }
}

fn reply_response(outcome: &RunOutcome, context: usize, started: Instant) -> Response {
    let reply = outcome.reply();
    info!(
        duration = ?started.elapsed(),
        input = outcome.total_input_tokens(),
        output = outcome.total_output_tokens(),
        total = outcome.total_tokens(),
        "complete"
    );

    let mut response = Response::new(Body::from(reply.data.clone()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(reply.mime.as_str()));
    run_headers(response.headers_mut(), outcome, context, started);
    response
}

fn run_headers(headers: &mut HeaderMap, outcome: &RunOutcome, context: usize, started: Instant) {
    let pairs = [
        (
            HEADER_RUN_DURATION,
            format!("{}", started.elapsed().as_secs_f64()),
        ),
        (
            HEADER_RUN_INPUT_TOKENS,
            outcome.total_input_tokens().to_string(),
        ),
        (
            HEADER_RUN_OUTPUT_TOKENS,
            outcome.total_output_tokens().to_string(),
        ),
        (HEADER_RUN_TOTAL_TOKENS, outcome.total_tokens().to_string()),
        (HEADER_RUN_CONTEXT, context.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn deadline_response() -> Response {
    error_response(&Error::Cancelled("request deadline elapsed".to_string()))
}

fn engine_error_response(error: &Error) -> Response {
    error!(error = %error, "engine call failed");
    error_response(error)
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::BadInput(_) => StatusCode::BAD_REQUEST,
        Error::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Invoke(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = Response::new(Body::from(error.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::BadInput("x".into()), StatusCode::BAD_REQUEST),
            (Error::Cancelled("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (Error::Invoke("x".into()), StatusCode::BAD_GATEWAY),
            (Error::ToolMissing("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Schema("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Store("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(error_response(&error).status(), expected);
        }
    }
}
