use anyhow::Result;
use clap::Parser;
use gpu_mounter::app::ApplicationBuilder;
use gpu_mounter::config::Cli;
use gpu_mounter::config::Commands;
use gpu_mounter::config::DaemonArgs;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(&daemon_args.metrics_file);

    tracing::info!(
        node = %daemon_args.node_name,
        pool = %daemon_args.pool_namespace,
        "Starting GPU mounter daemon {}",
        &**version::VERSION
    );

    let app = ApplicationBuilder::new(daemon_args).build().await?;
    app.run().await
}
