use std::{process, sync::Arc};

use roundcache::{
    cache::{CacheConfig, CacheState, FixedRoundClock},
    config,
    infra::{error::InfraError, http, telemetry, upstream::Upstream},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (_cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    let clock = Arc::new(FixedRoundClock::new(
        settings.round.genesis,
        settings.round.duration,
    ));
    let cache = CacheState::in_memory(CacheConfig::from(&settings.cache), clock);
    let upstream = Upstream::new(&settings.upstream)?;

    let router = http::build_router(cache, upstream.clone());
    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;

    info!(
        addr = %settings.server.addr,
        upstream = %upstream.base_url(),
        cache_enabled = settings.cache.enabled,
        round_ms = settings.round.duration.as_millis(),
        "roundcache listening"
    );

    http::serve(listener, router, settings.server.graceful_shutdown).await
}
