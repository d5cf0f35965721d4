use clap::Subcommand;

use deckhand_config::DeckhandConfig;

#[derive(Subcommand)]
pub enum DbAction {
    /// Run all pending database migrations.
    Migrate,
}

pub async fn handle_db(config: &DeckhandConfig, action: DbAction) -> anyhow::Result<()> {
    match action {
        DbAction::Migrate => run_migrations(config).await,
    }
}

/// Opening the store applies any pending migrations.
async fn run_migrations(config: &DeckhandConfig) -> anyhow::Result<()> {
    crate::open_store(config).await?;
    println!("Migrations complete.");
    Ok(())
}
