use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bids_gear::app::{App, DEFAULT_ANALYSIS_LEVEL, GearJob};
use bids_gear::bids::CommandValidator;
use bids_gear::config::{ConfigLoader, ENVIRONMENT_FILE, load_environment};
use bids_gear::error::GearError;
use bids_gear::executor::SystemExecutor;
use bids_gear::output::{JsonOutput, LogProgress};
use bids_gear::performance::SystemHost;
use bids_gear::platform::{FlywheelClient, FwCliDownloader};
use bids_gear::workspace::Workspace;

#[derive(Parser)]
#[command(name = "bids-gear")]
#[command(about = "Run a BIDS App as a Flywheel gear")]
#[command(version, author)]
struct Cli {
    /// Gear directory holding config.json, input/, work/ and output/.
    #[arg(long, default_value = "/flywheel/v0")]
    root: Utf8PathBuf,

    /// BIDS App executable; defaults to the manifest's `bids-app-binary`.
    #[arg(long)]
    bids_app: Option<String>,

    /// Name used in archive file names; defaults to the manifest name.
    #[arg(long)]
    gear_name: Option<String>,

    #[arg(long, default_value = DEFAULT_ANALYSIS_LEVEL)]
    analysis_level: String,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(gear) = report.downcast_ref::<GearError>() {
                return ExitCode::from(map_exit_code(gear));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &GearError) -> u8 {
    match error {
        GearError::MissingConfig(_)
        | GearError::ConfigRead(_)
        | GearError::ConfigParse(_)
        | GearError::InvalidOption { .. }
        | GearError::InvalidDestinationId(_) => 2,
        GearError::ApiHttp(_) | GearError::ApiStatus { .. } | GearError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<u8> {
    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(&cli.root)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.options.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let manifest = ConfigLoader::manifest(&cli.root).ok();
    let gear_name = cli
        .gear_name
        .or_else(|| manifest.as_ref().map(|manifest| manifest.name.clone()))
        .unwrap_or_else(|| "bids-app".to_string());
    let bids_app = cli
        .bids_app
        .or_else(|| manifest.as_ref().and_then(|manifest| manifest.bids_app_binary()));

    let workspace = Workspace::new(cli.root.clone(), gear_name, config.destination_id.clone());
    let environment = load_environment(&cli.root.join(ENVIRONMENT_FILE))?;

    let lookup = match config.inputs.api_key.as_deref().map(FlywheelClient::new) {
        Some(Ok(client)) => Some(client),
        Some(Err(err)) => {
            config.diagnostics.error(format!("Unable to reach the platform: {err}"));
            None
        }
        None => {
            config
                .diagnostics
                .error("The gear needs an api-key input to reach the platform");
            None
        }
    };
    let validator = CommandValidator::new(workspace.validator_output_path(), environment.clone());
    let executor = SystemExecutor::new(Some(workspace.time_report_path()));
    let app = App::new(lookup, FwCliDownloader::new(), validator, executor, SystemHost);

    let job = GearJob {
        config,
        workspace,
        bids_app,
        analysis_level: cli.analysis_level,
        environment,
    };
    let report = app.run(&job, &LogProgress);
    if cli.json {
        JsonOutput::print_report(&report).into_diagnostic()?;
    }
    Ok(u8::try_from(report.return_code).unwrap_or(1))
}
