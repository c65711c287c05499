use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blobferry_core::config::{
    ListingPolicy, Settings, load_settings, parse_settings, save_settings, validate_settings,
};
use blobferry_core::run_log::start_run_log;
use blobferry_core::{
    BlockBlobSink, BlockBlobSinkConfig, Collaborators, Progress, ProgressSink, RestSourceClient,
    RestSourceConfig, TransferConfig, TransferOptions, TraversalConfig, discover_targets,
    run_transfer, write_csv, write_json,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "blobferry")]
#[command(about = "Copy files from a document store into block-blob storage", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// List the files a transfer would pick up, without moving anything.
    Discover {
        #[command(flatten)]
        selection: Selection,
    },
    Transfer {
        #[command(subcommand)]
        cmd: TransferCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum TransferCmd {
    Run {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        concurrency: Option<u32>,
        #[arg(long)]
        report_csv: Option<PathBuf>,
        #[arg(long)]
        report_json: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct Selection {
    /// Folder id to start from.
    #[arg(long)]
    root: String,
    /// File extension to include; repeatable. Defaults to `transfer.extensions`.
    #[arg(long = "ext")]
    extensions: Vec<String>,
    #[arg(long)]
    no_recursive: bool,
    /// Stop discovery at the first folder that cannot be listed.
    #[arg(long)]
    fail_fast: bool,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: &Progress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "total": p.total,
            "done": p.done,
            "errors": p.errors,
            "queued": p.queued,
            "current": p.current,
        });
        println!("{line}");
    }

    fn on_file_progress(&self, file_name: &str, percent: u8) {
        let line = serde_json::json!({
            "type": "file.progress",
            "taskId": self.task_id,
            "fileName": file_name,
            "percent": percent,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("BLOBFERRY_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("BLOBFERRY_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Discover { selection } => {
            discover(&config_dir, &data_dir, selection, cli.json).await
        }
        Command::Transfer { cmd } => match cmd {
            TransferCmd::Run {
                selection,
                concurrency,
                report_csv,
                report_json,
            } => {
                transfer_run(
                    &config_dir,
                    &data_dir,
                    TransferArgs {
                        selection,
                        concurrency,
                        report_csv,
                        report_json,
                    },
                    cli.json,
                    cli.events,
                )
                .await
            }
        },
    }
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    let source_token_present = env_secret(&settings.source.token_env).is_some();
    let sink_sas_present = env_secret(&settings.sink.sas_token_env).is_some();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "secrets": {
                    "sourceTokenPresent": source_token_present,
                    "sinkSasPresent": sink_sas_present,
                }
            })
        );
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("sourceTokenPresent={source_token_present}");
        println!("sinkSasPresent={sink_sas_present}");
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = parse_settings(&input).map_err(map_core_err)?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn traversal_config(settings: &Settings, selection: &Selection) -> Result<TraversalConfig, CliError> {
    let extensions = if selection.extensions.is_empty() {
        settings.transfer.extensions.clone()
    } else {
        selection.extensions.clone()
    };
    let listing_policy = if selection.fail_fast {
        ListingPolicy::FailFast
    } else {
        settings.transfer.listing_policy().map_err(map_core_err)?
    };
    Ok(TraversalConfig {
        root_folder_id: selection.root.clone(),
        extensions,
        recursive: settings.transfer.recursive && !selection.no_recursive,
        listing_policy,
    })
}

fn source_client(settings: &Settings) -> Result<RestSourceClient, CliError> {
    if settings.source.base_url.is_empty() {
        return Err(CliError::new("config.invalid", "source.base_url is empty"));
    }
    Ok(RestSourceClient::new(RestSourceConfig {
        base_url: settings.source.base_url.clone(),
        token: env_secret(&settings.source.token_env),
    }))
}

fn sink_client(settings: &Settings) -> Result<BlockBlobSink, CliError> {
    if settings.sink.container_url.is_empty() {
        return Err(CliError::new("config.invalid", "sink.container_url is empty"));
    }
    Ok(BlockBlobSink::new(BlockBlobSinkConfig {
        container_url: settings.sink.container_url.clone(),
        sas_token: env_secret(&settings.sink.sas_token_env),
    }))
}

async fn discover(
    config_dir: &Path,
    data_dir: &Path,
    selection: Selection,
    json: bool,
) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    validate_settings(&settings).map_err(map_core_err)?;
    let traversal = traversal_config(&settings, &selection)?;
    let source = source_client(&settings)?;

    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let _log = start_run_log("discover", &task_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;

    let cancel = cancel_on_ctrl_c();
    let discovery = discover_targets(&source, &traversal, &cancel)
        .await
        .map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "targets": discovery.targets,
                "foldersListed": discovery.folders_listed,
                "foldersFailed": discovery.folders_failed,
                "aborted": discovery.aborted,
            })
        );
    } else {
        for t in &discovery.targets {
            println!("{}\t{}\t{}", t.relative_path, t.display_name, t.size);
        }
        println!(
            "targets={} foldersListed={} foldersFailed={}",
            discovery.targets.len(),
            discovery.folders_listed,
            discovery.folders_failed.len()
        );
    }
    Ok(())
}

struct TransferArgs {
    selection: Selection,
    concurrency: Option<u32>,
    report_csv: Option<PathBuf>,
    report_json: Option<PathBuf>,
}

async fn transfer_run(
    config_dir: &Path,
    data_dir: &Path,
    args: TransferArgs,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    validate_settings(&settings).map_err(map_core_err)?;

    let traversal = traversal_config(&settings, &args.selection)?;
    let source = Arc::new(source_client(&settings)?);
    let collaborators = Collaborators {
        catalog: source.clone(),
        metadata: source,
        sink: Arc::new(sink_client(&settings)?),
    };
    let config = TransferConfig {
        traversal,
        concurrency: args.concurrency.unwrap_or(settings.transfer.concurrency) as usize,
        pending: settings.transfer.pending_policy(),
        tuning: settings.transfer.upload_tuning(),
    };

    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let _log = start_run_log("transfer", &task_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;
    if events {
        emit_state(&task_id, "running", serde_json::json!({}));
    }

    let cancel = cancel_on_ctrl_c();
    let sink = NdjsonProgressSink {
        task_id: task_id.clone(),
    };
    let opts = TransferOptions {
        cancel: Some(&cancel),
        progress: if events { Some(&sink) } else { None },
    };
    let report = match run_transfer(&collaborators, config, opts).await {
        Ok(report) => report,
        Err(e) => {
            if events {
                emit_state(&task_id, "failed", serde_json::json!({ "code": e.code() }));
            }
            return Err(map_core_err(e));
        }
    };

    if let Some(path) = &args.report_csv {
        write_csv(path, &report.results).map_err(map_core_err)?;
    }
    if let Some(path) = &args.report_json {
        write_json(path, &report.results).map_err(map_core_err)?;
    }

    if events {
        let state = if report.aborted { "aborted" } else { "succeeded" };
        emit_state(
            &task_id,
            state,
            serde_json::json!({
                "runId": report.run_id,
                "done": report.succeeded(),
                "errors": report.failed(),
            }),
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&report)
                .map_err(|e| CliError::new("config.invalid", e.to_string()))?
        );
    } else {
        for r in report.results.iter().filter(|r| !r.is_ok()) {
            println!(
                "error\t{}/{}\t{}",
                r.path,
                r.file_name,
                r.message.as_deref().unwrap_or("")
            );
        }
        println!("runId={}", report.run_id);
        println!(
            "total={} done={} errors={} aborted={} durationMs={}",
            report.progress.total,
            report.progress.done,
            report.progress.errors,
            report.aborted,
            report.duration_ms
        );
    }
    Ok(())
}

fn emit_state(task_id: &str, state: &str, extra: serde_json::Value) {
    let mut line = serde_json::json!({
        "type": "task.state",
        "taskId": task_id,
        "kind": "transfer",
        "state": state,
    });
    if let (Some(obj), serde_json::Value::Object(extra)) = (line.as_object_mut(), extra) {
        obj.extend(extra);
    }
    println!("{line}");
}

/// A token that trips on the first Ctrl-C. Claimed files still finish.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(event = "run.abort_requested", "run.abort_requested");
            trip.cancel();
        }
    });
    cancel
}

fn env_secret(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("blobferry")
}

fn default_data_dir() -> PathBuf {
    default_config_dir()
}

fn map_core_err(e: blobferry_core::Error) -> CliError {
    use blobferry_core::Error;
    let code = e.code();
    match e {
        Error::Source { message } => CliError::retryable(code, message),
        Error::Traversal { folder_id, message } => CliError {
            details: serde_json::json!({ "folderId": folder_id }),
            ..CliError::retryable(code, message)
        },
        Error::Precondition { message } | Error::InvalidConfig { message } => {
            CliError::new(code, message)
        }
        other => CliError::new(code, other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
