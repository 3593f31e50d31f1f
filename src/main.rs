use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use formpilot::llm::OpenAiCompletion;
use formpilot::mapping::MappingCache;
use formpilot::store::{CsvSheet, JsonFileStore, LocalImageStore, TargetSheet};
use formpilot::{run_batch, PilotBrowser, PilotConfig, RunContext, SessionServices};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit the input data to every pending URL of the targets sheet
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Targets CSV with url,result,date,image columns
    #[arg(long, value_name = "FILE")]
    targets: PathBuf,

    /// Input CSV with key,value columns
    #[arg(long, value_name = "FILE")]
    input: PathBuf,

    /// YAML file overriding timeouts, limits, tuning and vocabulary
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for form records and the submissions log
    #[arg(long, default_value = "store")]
    store: PathBuf,

    #[arg(long, default_value = "screenshots")]
    screenshots: PathBuf,

    /// Directory screenshots are archived into
    #[arg(long, default_value = "archive")]
    archive: PathBuf,

    /// Show the browser window
    #[arg(long)]
    headful: bool,

    /// Fill forms but never click a submit control
    #[arg(long)]
    dry_run: bool,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("formpilot=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: RunArgs) -> formpilot::Result<()> {
    let mut config = match &args.config {
        Some(path) => PilotConfig::from_yaml_file(path)?,
        None => PilotConfig::default(),
    };
    if args.dry_run {
        config.tuning.dry_run = true;
    }

    let sheet = CsvSheet::new(&args.targets, &args.input);
    let input = sheet.input_data().await?;
    tracing::info!(keys = input.len(), "input data loaded");

    let services = SessionServices {
        config: Arc::new(config),
        completion: Arc::new(OpenAiCompletion::from_env()?),
        store: Arc::new(JsonFileStore::new(&args.store)),
        images: Arc::new(LocalImageStore::new(&args.archive)),
        cache: Arc::new(MappingCache::new()),
        input: Arc::new(input),
        run: RunContext::new(&args.screenshots),
    };

    let browser = PilotBrowser::builder()
        .headless(!args.headful)
        .build()
        .await?;
    let summary = run_batch(&browser, &sheet, &services).await;
    browser.close().await?;

    let summary = summary?;
    tracing::info!(
        sessions = summary.sessions,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "done"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => run(args).await,
    };
    if let Err(e) = outcome {
        tracing::error!("run failed: {e}");
        std::process::exit(1);
    }
}
