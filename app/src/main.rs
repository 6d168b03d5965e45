use clap::Parser;
use planforge::{Command, Scope, Shell};
use planforge_core::llm::LlmProviderKind;
use planforge_core::telemetry;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "planforge", version, about = "Turn requests into versioned multi-file projects")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Keep settings and data under <DIR>/.planforge instead of the user directories.
    #[arg(long, global = true, value_name = "DIR")]
    project_dir: Option<PathBuf>,
    /// Use the offline mock provider.
    #[arg(long, global = true)]
    mock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::default_filter())?;

    let cli = Cli::parse();
    let kind = if cli.mock {
        LlmProviderKind::Mock
    } else {
        LlmProviderKind::from_environment()
    };
    let scope = Scope::from_project_flag(cli.project_dir);
    let shell = Shell::open(&scope, kind).await?;

    let mut stdout = std::io::stdout();
    shell.run(cli.command, &mut stdout).await
}
