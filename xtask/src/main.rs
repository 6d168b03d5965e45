use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use planforge_core::state::AppState;
use planforge_core::store::{FileStore, KeyValueStore};
use planforge_core::{llm::LlmDriver, telemetry, CancellationToken};
use std::fs::File;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SMOKE_SCRIPT: [&str; 4] = [
    "Smoke plan.\n\n**File: main.py**\n",
    "```python\nprint(\"hi\")\n```\n",
    "**File: tests/test_main.py**\n",
    "```python\ndef test_main():\n    assert True\n```\n",
];

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Planforge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted generate, commit, revert and export cycle against a temporary store.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(temp_dir.path().join("data"))?);
    let state = AppState::with_store(store, LlmDriver::scripted(SMOKE_SCRIPT))?;

    let project = state.new_project();
    let baseline = state.commit(project.id, "empty baseline")?;

    let report = runtime.block_on(state.run_generation(
        project.id,
        "smoke test project",
        &CancellationToken::new(),
        &mut |_: &str| {},
    ))?;
    ensure!(report.extracted_files == 2, "expected 2 files, got {}", report.extracted_files);
    let generated = state.commit(project.id, "generated")?;

    state.revert(project.id, baseline.id)?;
    let reverted = state.project(project.id).context("project vanished")?;
    ensure!(reverted.files.is_empty(), "revert left files behind");

    state.revert(project.id, generated.id)?;
    let archive_path = temp_dir.path().join("smoke.zip");
    state.export_project(project.id, File::create(&archive_path)?)?;

    info!(
        "files" = report.extracted_files,
        "versions" = state.project(project.id).map(|p| p.versions.len()).unwrap_or_default(),
        "archive" = %archive_path.display(),
        "smoke test cycle completed"
    );

    Ok(())
}
