use anyhow::Result;
use clap::Parser;
use podfleet::cmd;
use podfleet::config::Cli;
use podfleet::config::Commands;
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
    let log_prefix = match &cli.command {
        Commands::Keepalive(_) => "keepalive",
        _ => "podfleet",
    };
    let _guard = logging::init(log_prefix);
    tracing::debug!("podfleet {}", &**version::VERSION);

    match cli.command {
        Commands::Launch(args) => cmd::launch::run_launch(args).await,
        Commands::Status(args) => cmd::status::run_status(args).await,
        Commands::Down(args) => cmd::down::run_down(args).await,
        Commands::Submit(args) => cmd::jobs::run_submit(*args).await,
        Commands::WatchJobs(args) => cmd::jobs::run_watch_jobs(args).await,
        Commands::Keepalive(args) => cmd::keepalive::run_keepalive(args).await,
    }
}
