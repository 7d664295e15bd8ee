use anyhow::Context;
use folio_kernel::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load Folio settings")?;
    folio_telemetry::init(&settings.telemetry).context("failed to initialize telemetry")?;

    tracing::info!(
        env = ?settings.environment,
        queue = %settings.queue.name,
        "folio-app starting"
    );

    folio_app::run(settings).await
}
