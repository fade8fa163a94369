//! HTTP control endpoint
//!
//! A deliberately plain-text surface: `GET /` returns the listing,
//! `POST /<command>` takes a port address as the request body and
//! returns the refreshed listing on success. Made for `curl` from cron
//! jobs and shell scripts, not for browsers.

use crate::SharedEngine;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use engine::{Command, Effect, PortAddress, render_listing};

pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/", get(listing).post(listing))
        .route("/reset", post(reset))
        .route("/hard", post(hard))
        .route("/disable", post(disable))
        .route("/up", post(up))
        .route("/down", post(down))
        .route("/off", post(off))
        .with_state(engine)
}

/// Bind and serve until the process exits.
pub async fn serve(engine: SharedEngine, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind HTTP endpoint on {bind}"))?;
    tracing::info!("HTTP control endpoint listening on {bind}");
    axum::serve(listener, router(engine))
        .await
        .context("HTTP endpoint terminated")?;
    Ok(())
}

async fn listing(State(engine): State<SharedEngine>) -> impl IntoResponse {
    render(engine).await
}

async fn reset(State(engine): State<SharedEngine>, body: String) -> impl IntoResponse {
    run(engine, Command::SoftReset, body).await
}

async fn hard(State(engine): State<SharedEngine>, body: String) -> impl IntoResponse {
    run(engine, Command::HardReset, body).await
}

async fn disable(State(engine): State<SharedEngine>, body: String) -> impl IntoResponse {
    run(engine, Command::Disable, body).await
}

async fn up(State(engine): State<SharedEngine>, body: String) -> impl IntoResponse {
    run(engine, Command::PowerUp, body).await
}

async fn down(State(engine): State<SharedEngine>, body: String) -> impl IntoResponse {
    run(engine, Command::PowerDown, body).await
}

async fn off(State(engine): State<SharedEngine>, body: String) -> impl IntoResponse {
    run(engine, Command::Off, body).await
}

/// Parse the body as a port address, execute, answer with the refreshed
/// listing. The engine is synchronous and may sleep in USB transfers,
/// so it runs on the blocking pool.
async fn run(engine: SharedEngine, command: Command, body: String) -> (StatusCode, String) {
    let address: PortAddress = match body.trim().parse() {
        Ok(address) => address,
        Err(err) => return (StatusCode::BAD_REQUEST, format!("{err}\n")),
    };

    let exec = engine.clone();
    let target = address.clone();
    let outcome =
        match tokio::task::spawn_blocking(move || exec.execute(&target, command)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(%address, %command, %err, "dispatch task failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error\n".into());
            }
        };

    match outcome.result {
        Ok(effect) => {
            let mut text = String::new();
            if effect == Effect::AppliedGanged {
                text.push_str("note: hub switches power for all ports at once\n");
            }
            let (status, body) = render(engine).await;
            text.push_str(&body);
            (status, text)
        }
        Err(err) => (StatusCode::BAD_REQUEST, format!("{err}\n")),
    }
}

async fn render(engine: SharedEngine) -> (StatusCode, String) {
    let result = tokio::task::spawn_blocking(move || engine.list()).await;
    match result {
        Ok(Ok(entries)) => (StatusCode::OK, format!("{}\n", render_listing(&entries))),
        Ok(Err(err)) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}\n")),
        Err(err) => {
            tracing::error!(%err, "listing task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error\n".into())
        }
    }
}
