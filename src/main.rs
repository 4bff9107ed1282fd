//! MilestoneFlow CLI Entry Point
//!
//! Runs one workflow definition against the in-memory engine with
//! simulated delegates.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! milestone-flow approval.yaml
//!
//! # With instance input and engine configuration
//! milestone-flow approval.yaml --input claim.json --config engine.yaml
//!
//! # Only print the execution plan
//! milestone-flow approval.yaml --plan-only
//! ```

use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::Value;

use milestone_flow::execution::{Engine, EngineConfig, SimulatedDelegates};
use milestone_flow::monitoring::ExecutionTimeline;
use milestone_flow::workflow::{build_plan, load_definition, ExecutionPlan, InstanceStatus};
use milestone_flow::{APP_NAME, VERSION};

/// Default definition file used when none is specified.
const DEFAULT_DEFINITION: &str = "workflow.yaml";

/// Default wait for the instance to finish.
const DEFAULT_TIMEOUT_SECS: u64 = 3_600;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    definition_path: String,
    input_path: Option<String>,
    config_path: Option<String>,
    tick_ms: Option<u64>,
    monitor_ms: Option<u64>,
    max_active: Option<usize>,
    latency_ms: u64,
    timeout_secs: u64,
    plan_only: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definition_path: DEFAULT_DEFINITION.to_string(),
            input_path: None,
            config_path: None,
            tick_ms: None,
            monitor_ms: None,
            max_active: None,
            latency_ms: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            plan_only: false,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: milestone-flow [OPTIONS] <DEFINITION_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>   Workflow definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --input PATH        JSON file used as instance input");
    println!("  --config PATH       Engine configuration YAML");
    println!("  --tick-ms N         Dispatcher interval in milliseconds");
    println!("  --monitor-ms N      Monitor interval in milliseconds");
    println!("  --max-active N      Maximum concurrently running nodes");
    println!("  --latency-ms N      Simulated delegate latency (default: 0)");
    println!(
        "  --timeout-secs N    Give up waiting after N seconds (default: {})",
        DEFAULT_TIMEOUT_SECS
    );
    println!("  --plan-only         Print the execution plan and exit");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  milestone-flow approval.yaml");
    println!("  milestone-flow approval.yaml --input claim.json --tick-ms 100");
    println!("  milestone-flow approval.yaml --plan-only");
}

fn option_value<'a>(args: &'a [String], i: usize, name: &str) -> Result<&'a String, String> {
    args.get(i)
        .ok_or_else(|| format!("{} requires an argument", name))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", name, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_seen = false;
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
            "--plan-only" => config.plan_only = true,
            "--verbose" | "-v" => config.verbose = true,
            "--input" => {
                i += 1;
                config.input_path = Some(option_value(args, i, arg)?.clone());
            }
            "--config" => {
                i += 1;
                config.config_path = Some(option_value(args, i, arg)?.clone());
            }
            "--tick-ms" => {
                i += 1;
                config.tick_ms = Some(parse_number(option_value(args, i, arg)?, arg)?);
            }
            "--monitor-ms" => {
                i += 1;
                config.monitor_ms = Some(parse_number(option_value(args, i, arg)?, arg)?);
            }
            "--max-active" => {
                i += 1;
                config.max_active = Some(parse_number(option_value(args, i, arg)?, arg)?);
            }
            "--latency-ms" => {
                i += 1;
                config.latency_ms = parse_number(option_value(args, i, arg)?, arg)?;
            }
            "--timeout-secs" => {
                i += 1;
                config.timeout_secs = parse_number(option_value(args, i, arg)?, arg)?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.definition_path = arg.clone();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Builds the engine configuration from the optional file and overrides.
fn engine_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(ms) = config.tick_ms {
        engine_config.dispatch_interval_ms = ms;
    }
    if let Some(ms) = config.monitor_ms {
        engine_config.monitor_interval_ms = ms;
    }
    if let Some(n) = config.max_active {
        engine_config.max_active = n;
    }
    Ok(engine_config)
}

fn read_input(path: Option<&str>) -> Result<Value, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(Value::Object(Default::default()));
    };
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Could not read input file '{}': {}", path, e))?;
    Ok(serde_json::from_str(&content)?)
}

fn print_plan(plan: &ExecutionPlan) {
    println!("Execution plan ({} steps):", plan.len());
    for (index, step) in plan.execution_steps.iter().enumerate() {
        let deps = if step.dependencies.is_empty() {
            "-".to_string()
        } else {
            step.dependencies.join(", ")
        };
        println!(
            "  {:>2}. {:<24} {:<9} after: {}{}",
            index + 1,
            step.node_id,
            step.node_type.as_str(),
            deps,
            step.parallel_group
                .as_ref()
                .map(|g| format!(" [{}]", g))
                .unwrap_or_default()
        );
    }
    println!("Critical path: {}", plan.critical_path.join(" -> "));
    println!(
        "Estimated duration: {} ms (critical path), {} ms (all steps)",
        plan.critical_path_duration(),
        plan.total_estimated_duration
    );
    println!();
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    // Load definition
    info!("Loading definition: {}", config.definition_path);
    let definition = load_definition(&config.definition_path).map_err(|e| {
        error!("Failed to load definition: {}", e);
        format!(
            "Could not load definition from '{}': {}",
            config.definition_path, e
        )
    })?;
    info!(
        "Definition '{}' loaded: {} nodes, {} edges",
        definition.id,
        definition.nodes.len(),
        definition.edges.len()
    );

    let engine_config = engine_config(&config)?;

    if config.plan_only {
        let plan = build_plan(&definition, "preview", &engine_config.retry_defaults())?;
        print_plan(&plan);
        return Ok(true);
    }

    let input = read_input(config.input_path.as_deref())?;
    let definition_id = definition.id.clone();

    let delegates =
        SimulatedDelegates::new().with_latency(Duration::from_millis(config.latency_ms));
    let engine = Engine::builder(engine_config)
        .delegates(Arc::new(delegates))
        .build();
    engine.register_definition(definition).await?;

    let handle = engine.spawn();
    let instance_id = engine.execute_workflow(&definition_id, input).await?;

    let status = engine.get_execution_status(&instance_id).await?;
    if let Some(plan) = engine.get_execution_plan(&instance_id).await? {
        print_plan(&plan);
    }
    info!("Instance {} is {}", instance_id, status.status);

    let timeout = Duration::from_secs(config.timeout_secs);
    tokio::select! {
        result = engine.wait_until_terminal(&instance_id, timeout) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling instance {}", instance_id);
            engine
                .cancel_instance(&instance_id, Some("Interrupted".to_string()))
                .await?;
        }
    }

    let status = engine.get_execution_status(&instance_id).await?;
    if !status.status.is_terminal() {
        warn!(
            "Instance {} still {} after {:?}, cancelling",
            instance_id, status.status, timeout
        );
        engine
            .cancel_instance(&instance_id, Some("Timed out waiting".to_string()))
            .await?;
    }
    handle.shutdown().await;

    let status = engine.get_execution_status(&instance_id).await?;
    let timeline = ExecutionTimeline::from_records(status.history.clone());

    println!();
    println!("Instance:  {}", status.instance_id);
    println!("Status:    {}", status.status);
    println!("Progress:  {:.1}%", status.progress);
    println!("Completed: {}", status.completed_nodes.join(", "));
    if !status.failed_nodes.is_empty() {
        println!("Failed:    {}", status.failed_nodes.join(", "));
    }
    if let Some(reason) = &status.failure_reason {
        println!("Reason:    {}", reason);
    }
    if !timeline.is_empty() {
        println!();
        println!("{}", timeline.gantt_chart());
    }
    println!("{}", engine.resource_summary());

    Ok(status.status == InstanceStatus::Completed)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
