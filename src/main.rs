use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::debug;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use comfyui_gen::catalogue::{config_template, convert_from_api, ApiFlavor};
use comfyui_gen::client::ComfyClient;
use comfyui_gen::config::{ConfigResolver, ConfigSources, Environment};
use comfyui_gen::diagnostics::{init_logging, Diagnostics};
use comfyui_gen::placeholder::{self, validate};
use comfyui_gen::workflow::WorkflowStore;
use comfyui_gen::{GenerationRequest, Pipeline, PipelineError, Result};

const HOME_ENV: &str = "COMFYUI_GEN_HOME";

#[derive(Parser)]
#[command(name = "comfyui-gen")]
#[command(about = "Generate images through a ComfyUI server")]
#[command(long_about = "\
Generate images through a ComfyUI server

Without a subcommand the plugin reads one JSON request from stdin, e.g.
{\"prompt\": \"a cat\", \"steps\": 30}, and prints one JSON response:
{\"status\": \"success\", \"result\": ...} or {\"status\": \"error\", \"error\": ...}.

Plugin directory layout:

  config.env                # COMFYUI_BASE_URL, PROJECT_BASE_PATH, SERVER_PORT, ...
  comfyui-settings.json     # serverUrl, apiKey, workflow, placeholder overrides
  workflows/<name>.json     # API-format workflow templates with %placeholders%")]
#[command(version)]
struct Cli {
    /// Plugin directory (defaults to $COMFYUI_GEN_HOME, then the executable's directory)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test the connection to the ComfyUI server
    Check,
    /// List checkpoints and LoRAs the server offers
    Models,
    /// List workflow templates in the plugin directory
    Workflows,
    /// Show the placeholders a workflow template uses
    Placeholders {
        /// Template name (defaults to the configured workflow)
        workflow: Option<String>,
    },
    /// Print the placeholder field catalogue
    ConfigTemplate,
    /// Read or change persisted settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Convert parameters from another generator (JSON on stdin)
    Convert {
        /// automatic1111, novelai or custom
        #[arg(long, default_value = "custom")]
        from: String,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print one setting, or all of them
    Get { key: Option<String> },
    /// Store a setting; VALUE is parsed as JSON, falling back to a plain string
    Set { key: String, value: String },
}

fn plugin_home(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(HOME_ENV).map(PathBuf::from))
        .or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn read_stdin() -> Result<String> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .map_err(|err| PipelineError::InvalidArgument(format!("Failed to read stdin: {}", err)))?;
    Ok(raw)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_plugin(pipeline: Pipeline) -> Result<String> {
    let raw = read_stdin().await?;
    let preview: String = raw.chars().take(200).collect();
    debug!("Received input: {}", preview);
    let request = GenerationRequest::parse(&raw)?;
    let summary = pipeline.generate(Value::Object(request.params().clone())).await?;
    Ok(summary.text)
}

async fn run_command(command: Command, resolver: ConfigResolver, diagnostics: Diagnostics) -> Result<bool> {
    match command {
        Command::Check => {
            let server = resolver.server().await?;
            let client = ComfyClient::new(&server.base_url, server.api_key.as_deref(), diagnostics)?;
            let report = client.check_connection().await;
            print_json(&report)?;
            Ok(report.success)
        }
        Command::Models => {
            let server = resolver.server().await?;
            let client = ComfyClient::new(&server.base_url, server.api_key.as_deref(), diagnostics)?;
            print_json(&client.list_models().await?)?;
            Ok(true)
        }
        Command::Workflows => {
            let store = WorkflowStore::new(&resolver.sources().workflows_dir, diagnostics);
            print_json(&store.list().await?)?;
            Ok(true)
        }
        Command::Placeholders { workflow } => {
            let name = match workflow {
                Some(name) => name,
                None => resolver.server().await?.workflow,
            };
            let store = WorkflowStore::new(&resolver.sources().workflows_dir, diagnostics);
            let template = store.load(&name).await;
            print_json(&json!({
                "workflow": name,
                "placeholders": placeholder::extract(template.as_value()),
            }))?;
            Ok(true)
        }
        Command::ConfigTemplate => {
            print_json(&config_template())?;
            Ok(true)
        }
        Command::Settings(SettingsCommand::Get { key }) => {
            let settings = &resolver.sources().settings;
            match key {
                Some(key) => print_json(&settings.get(&key).await.unwrap_or(Value::Null))?,
                None => print_json(&settings.export().await)?,
            }
            Ok(true)
        }
        Command::Settings(SettingsCommand::Set { key, value }) => {
            let value = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
            let verdict = validate(&key, &value);
            if !verdict.valid {
                return Err(PipelineError::InvalidArgument(verdict.reason));
            }
            let changed = resolver.sources().settings.set(&key, value).await?;
            print_json(&json!({ "success": true, "changed": changed }))?;
            Ok(true)
        }
        Command::Convert { from } => {
            let flavor: ApiFlavor = from.parse()?;
            let data = match serde_json::from_str::<Value>(&read_stdin().await?)? {
                Value::Object(map) => map,
                other => {
                    return Err(PipelineError::InvalidArgument(format!(
                        "Expected a JSON object, got {}",
                        other
                    )))
                }
            };
            print_json(&convert_from_api(&data, flavor))?;
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let sources = ConfigSources::in_dir(plugin_home(cli.home));
    let env = Environment::from_process();

    let verbose = ConfigResolver::new(sources.clone(), env.clone(), Diagnostics::quiet())
        .server()
        .await
        .map(|server| server.debug)
        .unwrap_or(false);
    init_logging(verbose);
    let diagnostics = Diagnostics::new(verbose);
    let resolver = ConfigResolver::new(sources, env, diagnostics);

    match cli.command {
        None => {
            let response = match run_plugin(Pipeline::new(resolver, diagnostics)).await {
                Ok(result) => json!({ "status": "success", "result": result }),
                Err(err) => json!({ "status": "error", "error": err.user_message() }),
            };
            println!("{}", response);
            if response["status"] == "success" {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Some(command) => match run_command(command, resolver, diagnostics).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(err) => {
                println!("{}", json!({ "status": "error", "error": err.user_message() }));
                ExitCode::FAILURE
            }
        },
    }
}
