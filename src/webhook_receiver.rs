//! The inbound HTTP surface: `POST /webhook` decodes the producer payload
//! and hands it to the [`AlertService`](crate::service::AlertService).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter_vec, IntCounterVec};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::alert::NormalizeError;
use crate::service::AlertService;
use crate::settings::Settings;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl ServerSettings {
    pub fn global() -> &'static Self {
        &Settings::global().server
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

static ENVELOPES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("received_envelopes", "total number of webhook envelopes")
            .namespace("foghorn")
            .subsystem("webhook_receiver"),
        &["outcome"]
    )
    .unwrap()
});

struct State {
    service: AlertService,
    request_seq: AtomicU64,
}

async fn webhook(
    Extension(state): Extension<Arc<State>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let request = state.request_seq.fetch_add(1, Ordering::Relaxed);

    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(request, error = %rejection, "webhook body is not json");
            ENVELOPES.with_label_values(&["invalid_json"]).inc();
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "InvalidJson"})),
            );
        }
    };

    info!(request, "received webhook envelope");

    match state.service.process(&payload).await {
        Ok(result) => {
            ENVELOPES.with_label_values(&["ok"]).inc();
            info!(request, outcomes = result.sent.len(), "webhook envelope processed");
            (
                StatusCode::OK,
                Json(json!({"ok": result.ok, "sent": result.sent})),
            )
        }
        Err(NormalizeError::UnrecognizedPayload) => {
            warn!(request, "rejecting unrecognized payload");
            ENVELOPES.with_label_values(&["unrecognized"]).inc();
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "UnrecognizedPayload"})),
            )
        }
        Err(err @ NormalizeError::EmptyEnvelope) => {
            warn!(request, error = %err, "rejecting envelope without usable alerts");
            ENVELOPES.with_label_values(&["empty"]).inc();
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "EmptyEnvelope"})),
            )
        }
    }
}

pub async fn run(service: AlertService) -> Result<()> {
    let state = Arc::new(State {
        service,
        request_seq: AtomicU64::new(1),
    });
    let addr = ServerSettings::global().to_socket_addr();

    let app = Router::new()
        .route("/webhook", post(webhook))
        .layer(Extension(state));

    info!(%addr, "webhook receiver listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
