use {anyhow::Result, clap::Subcommand, serde_json::json};

use {
    deckhand_config::DeckhandConfig,
    deckhand_cron::{
        store::MirrorStore,
        types::{QueueKind, now_ms},
    },
};

#[derive(Subcommand)]
pub enum EnqueueAction {
    /// Ask the worker to trigger a job immediately.
    Run { job_id: String },
    /// Ask the worker to remove a job from the daemon.
    Delete { job_id: String },
}

impl EnqueueAction {
    fn into_parts(self) -> (QueueKind, String) {
        match self {
            Self::Run { job_id } => (QueueKind::Run, job_id),
            Self::Delete { job_id } => (QueueKind::Delete, job_id),
        }
    }
}

pub async fn handle_enqueue(config: &DeckhandConfig, action: EnqueueAction) -> Result<()> {
    let project_id = config.store.require_project_id()?;
    let store = crate::open_store(config).await?;
    let (queue, job_id) = action.into_parts();

    let request = store.enqueue(queue, project_id, &job_id, now_ms()).await?;
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}

/// Print the stored fingerprint and mirrored jobs for the configured project.
pub async fn status(config: &DeckhandConfig) -> Result<()> {
    let project_id = config.store.require_project_id()?;
    let store = crate::open_store(config).await?;

    let fingerprint = store.read_fingerprint(project_id).await?;
    let jobs = store.list_mirror_rows(project_id).await?;
    let summary = json!({
        "projectId": project_id,
        "fingerprint": fingerprint,
        "jobs": jobs,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
