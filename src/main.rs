use std::{process, sync::Arc};

use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use webshot::{
    application::{
        error::AppError,
        render::ProcessRenderer,
        snapshot::SnapshotService,
    },
    config,
    domain::snapshot::ViewportLimits,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        storage::ArtifactStore,
        telemetry,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
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

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = ArtifactStore::new(settings.storage.data_dir.clone()).map_err(|err| {
        InfraError::configuration(format!(
            "cannot create data directory {}: {err}",
            settings.storage.data_dir.display()
        ))
    })?;
    let store = Arc::new(store);

    let renderer = Arc::new(ProcessRenderer::from_settings(&settings.render));
    let snapshots = Arc::new(SnapshotService::new(
        Arc::clone(&store),
        renderer,
        ViewportLimits::from(&settings.snapshot),
    ));

    let router = http::build_router(HttpState::new(snapshots), settings.server.banner.as_deref());

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        addr = %settings.server.addr,
        data_dir = %store.root().display(),
        renderer = %settings.render.executable.display(),
        script = %settings.render.script.display(),
        debug = settings.snapshot.debug,
        "webshot listening"
    );

    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}
