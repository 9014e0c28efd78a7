//! flowcore CLI Entry Point
//!
//! Provides a command-line interface for exploding templates and moving
//! tasks by hand.
//!
//! # Usage
//!
//! ```bash
//! # Validate template files
//! flowcore check templates/purchase_order.yaml
//!
//! # Start a workflow for a business entity
//! flowcore explode purchase_order order PO-1001 --data '{"amount": 1200}'
//!
//! # List an entity's tasks, or a user's inbox
//! flowcore tasks 1
//! flowcore inbox alice
//!
//! # Re-run the completion check of an entity
//! flowcore validate 1
//!
//! # Patch process data, complete or retry a task
//! flowcore update 3 '{"decision": "yes"}'
//! flowcore complete 3 --user alice
//! flowcore retry 4
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::{ColoredString, Colorize};
use log::{error, info};
use serde_json::Value;

use flowcore::config::{load_config, EngineConfig};
use flowcore::execution::{CompletionOutcome, Engine, ExplodeRequest};
use flowcore::store::{SqliteStore, TaskStatus, WorkflowTask};
use flowcore::template::validator::{unreachable_nodes, validate_template};
use flowcore::template::{load_template, DirTemplateStore, ProcessData};
use flowcore::{APP_NAME, VERSION};

/// Subcommand selected on the command line.
#[derive(Debug, PartialEq)]
enum Command {
    Explode {
        template: String,
        entity_type: String,
        entity_name: String,
    },
    Complete(i64),
    Update(i64, String),
    Retry(i64),
    Tasks(i64),
    Validate(i64),
    Inbox(String),
    Check(Vec<String>),
}

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Cli {
    command: Option<Command>,
    config_path: Option<PathBuf>,
    database: Option<PathBuf>,
    templates_dir: Option<PathBuf>,
    user: Option<String>,
    client_id: String,
    description: String,
    data: Option<String>,
    verbose: bool,
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

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowcore [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  explode <TEMPLATE> <ENTITY_TYPE> <ENTITY_NAME>  Start a workflow");
    println!("  complete <TASK_ID>                            Complete a started task");
    println!("  update <TASK_ID> <JSON>                       Merge JSON into process data");
    println!("  retry <TASK_ID>                               Re-run a failed task");
    println!("  tasks <ENTITY_ID>                             List an entity's tasks");
    println!("  validate <ENTITY_ID>                          Close an entity whose tasks are all done");
    println!("  inbox <USER>                                  List a user's open tasks");
    println!("  check <TEMPLATE_FILE>...                      Validate template files");
    println!();
    println!("Options:");
    println!("  --config PATH       Configuration file (default: $FLOWCORE_CONFIG or ./flowcore.yaml)");
    println!("  --db PATH           SQLite database file");
    println!("  --templates DIR     Template directory");
    println!("  --user NAME         Actor recorded for this command");
    println!("  --client ID         Client ID for explode");
    println!("  --description TEXT  Description for explode");
    println!("  --data JSON         Initial process data for explode");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

fn parse_id(kind: &str, value: Option<&String>) -> Result<i64, String> {
    let value = value.ok_or_else(|| format!("missing {}", kind))?;
    value
        .parse()
        .map_err(|_| format!("Invalid {}: {}", kind, value))
}

/// Builds the subcommand from positional arguments.
fn parse_command(positional: &[String]) -> Result<Command, String> {
    let (name, rest) = positional
        .split_first()
        .ok_or_else(|| "missing command".to_string())?;

    let command = match name.as_str() {
        "explode" => match rest {
            [template, entity_type, entity_name] => Command::Explode {
                template: template.clone(),
                entity_type: entity_type.clone(),
                entity_name: entity_name.clone(),
            },
            _ => return Err("explode requires <TEMPLATE> <ENTITY_TYPE> <ENTITY_NAME>".to_string()),
        },
        "complete" => Command::Complete(parse_id("task ID", rest.first())?),
        "retry" => Command::Retry(parse_id("task ID", rest.first())?),
        "tasks" => Command::Tasks(parse_id("entity ID", rest.first())?),
        "validate" => Command::Validate(parse_id("entity ID", rest.first())?),
        "update" => {
            let id = parse_id("task ID", rest.first())?;
            let patch = rest
                .get(1)
                .ok_or_else(|| "update requires a JSON object".to_string())?;
            Command::Update(id, patch.clone())
        }
        "inbox" => Command::Inbox(
            rest.first()
                .ok_or_else(|| "inbox requires a user name".to_string())?
                .clone(),
        ),
        "check" => {
            if rest.is_empty() {
                return Err("check requires at least one template file".to_string());
            }
            Command::Check(rest.to_vec())
        }
        other => return Err(format!("Unknown command: {}", other)),
    };

    let expected = match &command {
        Command::Explode { .. } => 3,
        Command::Update(..) => 2,
        Command::Check(files) => files.len(),
        _ => 1,
    };
    if rest.len() > expected {
        return Err(format!("Unexpected argument: {}", rest[expected]));
    }

    Ok(command)
}

/// Parses command-line arguments into a Cli struct.
fn parse_arguments(args: &[String]) -> Result<Cli, String> {
    let mut cli = Cli::default();
    let mut positional = Vec::new();
    let mut i = 1; // Skip program name

    let value_of = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

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
            "--verbose" | "-v" => cli.verbose = true,
            "--config" => cli.config_path = Some(PathBuf::from(value_of(&mut i, arg)?)),
            "--db" => cli.database = Some(PathBuf::from(value_of(&mut i, arg)?)),
            "--templates" => cli.templates_dir = Some(PathBuf::from(value_of(&mut i, arg)?)),
            "--user" => cli.user = Some(value_of(&mut i, arg)?),
            "--client" => cli.client_id = value_of(&mut i, arg)?,
            "--description" => cli.description = value_of(&mut i, arg)?,
            "--data" => cli.data = Some(value_of(&mut i, arg)?),
            flag if flag.starts_with('-') => {
                return Err(format!("Unknown option: {}", flag));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    cli.command = Some(parse_command(&positional)?);
    Ok(cli)
}

/// Parses a JSON object argument into process data.
fn parse_data(raw: &str) -> Result<ProcessData, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(format!("Process data must be a JSON object: {}", raw)),
        Err(e) => Err(format!("Invalid JSON '{}': {}", raw, e)),
    }
}

fn status_label(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Created => status.as_str().normal(),
        TaskStatus::Started => status.as_str().yellow(),
        TaskStatus::ExecutionError => status.as_str().red().bold(),
        TaskStatus::Completed => status.as_str().green(),
    }
}

fn outcome_label(outcome: CompletionOutcome) -> ColoredString {
    match outcome {
        CompletionOutcome::Completed => "completed".green().bold(),
        CompletionOutcome::AlreadyCompleted => "already completed".green(),
        CompletionOutcome::Pending { remaining } => {
            format!("pending ({} open tasks)", remaining).yellow()
        }
    }
}

fn print_tasks(tasks: &[WorkflowTask]) {
    if tasks.is_empty() {
        println!("{}", "No tasks".dimmed());
        return;
    }

    println!(
        "{:>6}  {:>6}  {:<20} {:<8} {}",
        "TASK", "ENTITY", "NODE", "TYPE", "STATUS"
    );
    for task in tasks {
        println!(
            "{:>6}  {:>6}  {:<20} {:<8} {}",
            task.id,
            task.workflow_entity_id,
            task.node_id,
            task.node_type.as_str(),
            status_label(task.status)
        );
    }
}

/// Validates template files; returns false if any is invalid.
fn check_templates(files: &[String]) -> bool {
    let mut all_valid = true;

    for file in files {
        let template = match load_template(file) {
            Ok(template) => template,
            Err(e) => {
                println!("{} {}: {}", "✗".red(), file, e);
                all_valid = false;
                continue;
            }
        };

        let errors = validate_template(&template);
        if errors.is_empty() {
            println!(
                "{} {} ({} v{}, {} nodes)",
                "✓".green(),
                file,
                template.name,
                template.version,
                template.len()
            );
            for id in unreachable_nodes(&template) {
                println!("    {} node '{}' is unreachable", "!".yellow(), id);
            }
        } else {
            all_valid = false;
            println!("{} {}", "✗".red(), file);
            for e in errors {
                println!("    {}", e);
            }
        }
    }

    all_valid
}

/// Builds the engine from configuration and command-line overrides.
fn build_engine(cli: &Cli, config: &EngineConfig) -> Result<Engine, Box<dyn std::error::Error>> {
    let database = cli.database.clone().unwrap_or_else(|| config.database.clone());
    let templates_dir = cli
        .templates_dir
        .clone()
        .unwrap_or_else(|| config.templates_dir.clone());

    info!("Database: {}", database.display());
    info!("Templates: {}", templates_dir.display());

    let store = SqliteStore::open(&database)
        .map_err(|e| format!("Could not open database '{}': {}", database.display(), e))?;

    let mut engine = Engine::new(
        Arc::new(DirTemplateStore::new(templates_dir)),
        Arc::new(store),
    );
    engine.set_handler_timeout(config.handler_timeout());
    engine.set_actor(cli.user.clone().unwrap_or_else(|| config.actor.clone()));
    Ok(engine)
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);

    let Some(command) = cli.command.take() else {
        return Err("missing command".into());
    };

    if let Command::Check(files) = &command {
        return if check_templates(files) {
            Ok(())
        } else {
            Err("template validation failed".into())
        };
    }

    let config = match &cli.config_path {
        Some(path) => EngineConfig::load_from(path)?,
        None => load_config()?,
    };
    let engine = build_engine(&cli, &config)?;

    let result = run_command(&engine, &cli, command);
    // Completion checks run on background threads; let them land before exit
    engine.wait_pending();
    result
}

/// Runs one engine-backed command.
fn run_command(
    engine: &Engine,
    cli: &Cli,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Explode {
            template,
            entity_type,
            entity_name,
        } => {
            let data = match &cli.data {
                Some(raw) => parse_data(raw)?,
                None => ProcessData::new(),
            };
            let request = ExplodeRequest::new(template, entity_type, entity_name)
                .with_user(engine.actor())
                .with_client_id(cli.client_id.clone())
                .with_description(cli.description.clone())
                .with_data(data);

            let entity_id = engine.explode(&request).map_err(|e| {
                error!("Explosion failed: {}", e);
                e
            })?;
            println!("{} entity {}", "Created".green().bold(), entity_id);
            print_tasks(&engine.tasks(entity_id)?);
        }
        Command::Complete(task_id) => {
            let result = engine.complete_task(task_id);
            let task = engine.task(task_id)?;
            print_tasks(&engine.tasks(task.workflow_entity_id)?);
            result?;
        }
        Command::Update(task_id, raw) => {
            let data = engine.update_process_data(task_id, &parse_data(&raw)?)?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Retry(task_id) => {
            let result = engine.retry_task(task_id);
            println!("Task {}: {}", task_id, status_label(engine.task(task_id)?.status));
            result?;
        }
        Command::Tasks(entity_id) => {
            let entity = engine.entity(entity_id)?;
            println!(
                "Entity {} {} '{}' ({})",
                entity.id, entity.entity_type, entity.entity_name, entity.status
            );
            print_tasks(&engine.tasks(entity_id)?);
        }
        Command::Validate(entity_id) => {
            let outcome = engine.validate_entity(entity_id)?;
            println!("Entity {}: {}", entity_id, outcome_label(outcome));
        }
        Command::Inbox(user) => print_tasks(&engine.inbox(&user)?),
        Command::Check(_) => {}
    }

    Ok(())
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
