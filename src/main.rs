//! Alert routing gateway.
//!
//! Receives monitoring webhooks from prometheus alertmanager and grafana
//! unified alerting, normalizes them to one alert shape, matches them
//! against a declarative routing table and fans them out to chat and
//! webhook channels, optionally with a rendered trend chart.

use anyhow::{Context, Result};
use tracing::info;

use crate::service::AlertService;
use crate::settings::Settings;

mod alert;
mod chart;
mod dedup;
mod filter;
mod log;
mod plotter;
mod renderer;
mod routing;
mod senders;
mod service;
mod settings;
mod telemetry_endpoint;
mod webhook_receiver;

/// exit the complete program if one thread panics
fn setup_panic_handler() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let settings = Settings::global();
    log::setup_logging().context("could not setup logging")?;

    let enabled = settings.channels.values().filter(|c| c.enabled).count();
    info!(
        channels = settings.channels.len(),
        enabled,
        rules = settings.routing.len(),
        "configuration loaded"
    );

    let service = AlertService::new(settings).context("failed to construct alert service")?;

    if let Some(telemetry) = &settings.telemetry_endpoint {
        tokio::spawn(async move {
            #[allow(clippy::expect_used)]
            telemetry_endpoint::run_telemetry_endpoint(telemetry)
                .await
                .expect("telemetry endpoint crashed");
        });
    }

    webhook_receiver::run(service).await
}
