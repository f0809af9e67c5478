//! ContentFlow CLI Entry Point
//!
//! Registers a workflow definition in a file-backed store and starts one
//! instance of it.
//!
//! # Usage
//!
//! ```bash
//! # Run a step workflow for a subject
//! contentflow publish.yaml --subject post-42 --input '{"title": "Hello"}'
//!
//! # Only check that a definition is valid
//! contentflow publish.yaml --validate-only
//!
//! # Use a specific store directory and engine config
//! contentflow publish.yaml --store /var/lib/contentflow --config engine.yaml
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use serde_json::Value;

use contentflow::config::EngineConfig;
use contentflow::services::Services;
use contentflow::workflow::{
    load_definition, quick_validate, validate, InstanceStatus, WorkflowInstance,
};
use contentflow::{FileStore, WorkflowError, WorkflowService, APP_NAME, VERSION};

/// Actor recorded when none is given.
const DEFAULT_ACTOR: &str = "cli";

/// Subject used when none is given.
const DEFAULT_SUBJECT: &str = "cli-subject";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    definition_path: Option<String>,
    input: Value,
    subject_id: String,
    actor: String,
    store_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
    validate_only: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definition_path: None,
            input: Value::Object(Default::default()),
            subject_id: DEFAULT_SUBJECT.to_string(),
            actor: DEFAULT_ACTOR.to_string(),
            store_dir: None,
            config_path: None,
            validate_only: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Content Workflow Engine");
    println!();
}

fn print_usage() {
    println!("Usage: contentflow [OPTIONS] <DEFINITION_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>   Workflow definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --input JSON        Instance input (default: {{}})");
    println!("  --subject ID        Subject the instance governs (default: {})", DEFAULT_SUBJECT);
    println!("  --actor NAME        Actor recorded in history (default: {})", DEFAULT_ACTOR);
    println!("  --store DIR         Store directory (default: $CONTENTFLOW_HOME or .contentflow)");
    println!("  --config FILE       Engine configuration YAML");
    println!("  --validate-only     Validate the definition and exit");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", name))
}

fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--validate-only" => config.validate_only = true,
            "--verbose" | "-v" => config.verbose = true,
            "--input" => {
                let raw = option_value(args, &mut i, "--input")?;
                config.input = serde_json::from_str(raw)
                    .map_err(|e| format!("Invalid --input JSON: {}", e))?;
            }
            "--subject" => config.subject_id = option_value(args, &mut i, "--subject")?.to_string(),
            "--actor" => config.actor = option_value(args, &mut i, "--actor")?.to_string(),
            "--store" => {
                config.store_dir = Some(PathBuf::from(option_value(args, &mut i, "--store")?))
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(option_value(args, &mut i, "--config")?))
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.definition_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.definition_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

fn status_label(instance: &WorkflowInstance) -> String {
    match instance.status {
        InstanceStatus::Completed => "COMPLETED".green().bold().to_string(),
        InstanceStatus::Failed => "FAILED".red().bold().to_string(),
        InstanceStatus::Active if instance.is_waiting() => "WAITING".yellow().bold().to_string(),
        InstanceStatus::Active => "ACTIVE".cyan().bold().to_string(),
    }
}

fn print_instance(instance: &WorkflowInstance, version: u64) {
    println!();
    println!("Instance {} (version {})", instance.id.bold(), version);
    println!("  Status:   {}", status_label(instance));
    if let Some(stage) = &instance.current_stage {
        println!("  Stage:    {}", stage);
    }
    if let Some(wait) = &instance.waiting {
        println!("  Waiting:  {} (correlation {})", wait.step_id, wait.correlation_id);
    }
    if let Some(reason) = &instance.error {
        println!("  Error:    {}", reason.red());
    }

    println!();
    println!("History:");
    for entry in &instance.history {
        let node = entry
            .step_id
            .as_deref()
            .or(entry.stage_id.as_deref())
            .unwrap_or("-");
        println!(
            "  {} {:<16} {:<10} {}",
            entry.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            node,
            entry.action,
            entry.actor.dimmed()
        );
    }

    if instance.status == InstanceStatus::Completed {
        println!();
        println!("Output:");
        println!(
            "{}",
            serde_json::to_string_pretty(&instance.output).unwrap_or_default()
        );
    }
}

async fn execute(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let path = config
        .definition_path
        .ok_or("No definition file given")?;

    info!("Loading definition: {}", path);
    let definition = load_definition(&path).map_err(|e| {
        error!("Failed to load definition: {}", e);
        format!("Could not load definition from '{}': {}", path, e)
    })?;
    if let Err(e) = validate(&definition) {
        for problem in quick_validate(&definition) {
            error!("  {}", problem);
        }
        return Err(format!("[{}] {}", e.code(), e).into());
    }
    info!(
        "Definition '{}' is valid: {} steps, {} stages",
        definition.id,
        definition.steps.len(),
        definition.stages.len()
    );

    if config.validate_only {
        println!("{}", "Definition is valid".green());
        return Ok(());
    }

    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };
    let store_dir = config
        .store_dir
        .unwrap_or_else(|| engine_config.store_dir.clone());
    info!("Store directory: {}", store_dir.display());

    let store = FileStore::open(store_dir).await?;
    let service = WorkflowService::new(Arc::new(store), Services::default(), engine_config);

    let workflow_id = definition.id.clone();
    match service.get_workflow(&workflow_id).await {
        Ok(_) => {
            service.update_workflow(definition).await?;
        }
        Err(WorkflowError::NotFound { .. }) => {
            service.create_workflow(definition).await?;
        }
        Err(e) => return Err(e.into()),
    }

    let recovered = service.recover_all().await?;
    if !recovered.is_empty() {
        info!("Recovered {} active instances", recovered.len());
    }

    let started = service
        .start_instance(&workflow_id, &config.subject_id, config.input, &config.actor)
        .await?;
    print_instance(&started.value, started.version);

    if started.value.status == InstanceStatus::Failed {
        return Err(format!("Instance {} failed", started.value.id).into());
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(config))
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
