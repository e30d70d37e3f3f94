// Aura CLI
//
// Design Decision: clap derive for argument parsing, matching the facade's
// verbs one to one.
// Design Decision: text or json output so the CLI is scriptable.
// Exit codes: 0 success, 1 initialization or run failure, 2 plan/task not
// found, 3 user-argument error.

use std::path::PathBuf;
use std::process::ExitCode;

use aura_engine::facade::FacadeError;
use aura_engine::state::RunResultKind;
use aura_engine::Scheduler;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::error;
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_INIT: u8 = 1;
const EXIT_NOT_FOUND: u8 = 2;
const EXIT_USER_ARG: u8 = 3;

#[derive(Parser)]
#[command(name = "aura")]
#[command(about = "Aura automation framework - run and schedule declarative tasks")]
#[command(version)]
struct Cli {
    /// Project root containing plans/ and packages/
    #[arg(long, env = "AURA_ROOT", default_value = ".")]
    root: PathBuf,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task ad hoc and wait for its result
    Run {
        /// Plan name
        plan: String,

        /// Task id within the plan (e.g. quests/daily/main)
        task: String,

        /// JSON object seeded into the task context
        #[arg(long)]
        params: Option<String>,
    },

    /// List all plans
    ListPlans,

    /// List a plan's tasks
    ListTasks {
        /// Plan name
        plan: String,
    },

    /// List registered actions
    ListActions,

    /// Show schedule items with their run status
    Schedule,

    /// Show aggregate scheduler status
    Status,

    /// Publish an event onto the bus
    Publish {
        /// Event name
        name: String,

        /// JSON payload object
        #[arg(long)]
        payload: Option<String>,

        /// Channel to publish on
        #[arg(long, default_value = "global")]
        channel: String,

        /// Source tag
        #[arg(long, default_value = "cli")]
        source: String,
    },

    /// Run the scheduler in the foreground until interrupted
    Serve,
}

fn parse_json_object(text: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

fn print_value(output: &str, value: &Value) {
    if output == "json" {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    } else {
        match serde_yaml::to_string(value) {
            Ok(text) => print!("{text}"),
            Err(_) => println!("{value}"),
        }
    }
}

fn not_found(err: &FacadeError) -> bool {
    matches!(
        err,
        FacadeError::PlanNotFound(_)
            | FacadeError::TaskNotFound(_)
            | FacadeError::ScheduleItemNotFound(_)
    )
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let scheduler = match Scheduler::new(&cli.root).await {
        Ok(scheduler) => scheduler,
        Err(err) => {
            error!(%err, "initialization failed");
            return ExitCode::from(EXIT_INIT);
        }
    };

    match run(&cli, &scheduler).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(%err, "command failed");
            if not_found(&err) {
                ExitCode::from(EXIT_NOT_FOUND)
            } else {
                ExitCode::from(EXIT_INIT)
            }
        }
    }
}

async fn run(cli: &Cli, scheduler: &Scheduler) -> Result<u8, FacadeError> {
    match &cli.command {
        Commands::Run { plan, task, params } => {
            let params = match params.as_deref().map(parse_json_object).transpose() {
                Ok(params) => params,
                Err(err) => {
                    error!(%err, "--params must be a JSON object");
                    return Ok(EXIT_USER_ARG);
                }
            };
            let result = scheduler.run_task_blocking(plan, task, params).await?;
            print_value(
                &cli.output,
                &serde_json::json!({
                    "task": format!("{plan}/{task}"),
                    "result": result.result,
                    "detail": result.detail,
                }),
            );
            Ok(if result.result == RunResultKind::Success {
                EXIT_OK
            } else {
                EXIT_INIT
            })
        }

        Commands::ListPlans => {
            let plans = scheduler.list_plans().await;
            print_value(&cli.output, &serde_json::json!(plans));
            Ok(EXIT_OK)
        }

        Commands::ListTasks { plan } => {
            let tasks = scheduler.list_tasks(plan).await?;
            print_value(&cli.output, &serde_json::json!(tasks));
            Ok(EXIT_OK)
        }

        Commands::ListActions => {
            let actions = scheduler.list_actions();
            print_value(
                &cli.output,
                &serde_json::to_value(actions).unwrap_or_default(),
            );
            Ok(EXIT_OK)
        }

        Commands::Schedule => {
            let status = scheduler.get_schedule_status().await;
            print_value(&cli.output, &serde_json::json!(status));
            Ok(EXIT_OK)
        }

        Commands::Status => {
            let status = scheduler.status().await;
            print_value(
                &cli.output,
                &serde_json::to_value(status).unwrap_or_default(),
            );
            Ok(EXIT_OK)
        }

        Commands::Publish {
            name,
            payload,
            channel,
            source,
        } => {
            let payload = match payload.as_deref().map(parse_json_object).transpose() {
                Ok(payload) => payload
                    .map(Value::Object)
                    .unwrap_or_else(|| Value::Object(Map::new())),
                Err(err) => {
                    error!(%err, "--payload must be a JSON object");
                    return Ok(EXIT_USER_ARG);
                }
            };
            let reached = scheduler
                .publish_event(name, payload, Some(source), channel)
                .await;
            print_value(
                &cli.output,
                &serde_json::json!({"published": name, "subscribers": reached}),
            );
            Ok(EXIT_OK)
        }

        Commands::Serve => {
            scheduler.start().await;
            println!("scheduler running; press ctrl-c to stop");
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(%err, "signal handler failed");
            }
            scheduler.stop().await;
            Ok(EXIT_OK)
        }
    }
}
