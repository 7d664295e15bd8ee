use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use folio_app::modules::queue::apply::RecordApplier;
use folio_app::AppState;
use folio_authz::TokenService;
use folio_events::{Action, DrainOptions, Entity, MutationRecord};
use folio_kernel::settings::Settings;

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Folio catalog service and queue tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve,
    /// Publish one mutation to the queue
    Enqueue {
        /// author or book
        #[arg(long)]
        entity: String,
        /// create, update or delete
        #[arg(long)]
        action: String,
        /// Mutation payload as JSON
        #[arg(long, default_value = "{}")]
        data: String,
        /// Username recorded as the submitter
        #[arg(long = "as", default_value = "cli")]
        submitted_by: String,
    },
    /// Drain the queue once into the configured datastore
    Drain {
        /// Override the drain window
        #[arg(long)]
        window_ms: Option<u64>,
        /// Override deliveries fetched per round trip
        #[arg(long)]
        prefetch: Option<usize>,
    },
    /// Print a signed token for local testing
    Token {
        #[arg(long)]
        id: String,
        #[arg(long)]
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load().context("failed to load Folio settings")?;
    folio_telemetry::init(&settings.telemetry).context("failed to initialize telemetry")?;

    match cli.command {
        Commands::Serve => folio_app::run(settings).await,
        Commands::Enqueue {
            entity,
            action,
            data,
            submitted_by,
        } => enqueue(&settings, &entity, &action, &data, &submitted_by).await,
        Commands::Drain {
            window_ms,
            prefetch,
        } => drain(&settings, window_ms, prefetch).await,
        Commands::Token { id, username } => {
            let token = TokenService::new(&settings.auth)
                .issue(&id, &username)
                .context("failed to sign token")?;
            println!("{}", token);
            Ok(())
        }
    }
}

fn parse_record(
    entity: &str,
    action: &str,
    data: &str,
    submitted_by: &str,
) -> anyhow::Result<MutationRecord> {
    let entity: Entity = entity.parse().context("invalid --entity")?;
    let action: Action = action.parse().context("invalid --action")?;
    let data: serde_json::Value = serde_json::from_str(data).context("--data is not valid JSON")?;
    if !data.is_object() {
        bail!("--data must be a JSON object");
    }

    Ok(MutationRecord::new(entity, action, data, submitted_by)?)
}

async fn enqueue(
    settings: &Settings,
    entity: &str,
    action: &str,
    data: &str,
    submitted_by: &str,
) -> anyhow::Result<()> {
    let record = parse_record(entity, action, data, submitted_by)?;

    let state = AppState::from_settings(settings).await?;
    if state.relay.describe().starts_with("memory://") {
        tracing::warn!("broker is in-process; the record is lost when this command exits");
    }

    state
        .relay
        .enqueue(&record)
        .await
        .context("failed to enqueue record")?;
    state.relay.close().await?;

    println!("queued {} {}", record.action(), record.entity());
    Ok(())
}

async fn drain(
    settings: &Settings,
    window_ms: Option<u64>,
    prefetch: Option<usize>,
) -> anyhow::Result<()> {
    let state = AppState::from_settings(settings).await?;
    state
        .store
        .ping()
        .await
        .with_context(|| format!("catalog store at {} did not answer", state.store.describe()))?;

    let defaults = state.relay.options();
    let options = DrainOptions {
        window: window_ms.map(Duration::from_millis).unwrap_or(defaults.window),
        prefetch: prefetch.map(|p| p.max(1)).unwrap_or(defaults.prefetch),
        ..defaults.clone()
    };

    let applier = RecordApplier::new(state.store.clone());
    let report = state
        .relay
        .drain_with(&applier, &options)
        .await
        .context("drain failed")?;
    state.relay.close().await?;

    println!(
        "applied={} requeued={} dead_lettered={} released={}",
        report.applied, report.requeued, report.dead_lettered, report.released
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn record_arguments_are_validated() {
        assert!(parse_record("author", "create", r#"{"name":"Ada"}"#, "cli").is_ok());
        assert!(parse_record("publisher", "create", "{}", "cli").is_err());
        assert!(parse_record("author", "delete", "{}", "cli").is_err());
        assert!(parse_record("author", "create", "[1]", "cli").is_err());
        assert!(parse_record("author", "create", "{", "cli").is_err());
    }
}
