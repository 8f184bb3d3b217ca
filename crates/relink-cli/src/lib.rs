use clap::error::ErrorKind;
use clap::{ArgAction, Parser, Subcommand};
use relink_core::{RULES_VERSION, RuleTable};
use relink_web::{
    BatchOptions, FileRegistrations, GatewayAdapter, RelinkConfig, ServiceWorker, correct_tree,
    register,
};
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use watch::ExportWatcher;

mod watch;

const DEFAULT_PREVIEW_CID: &str = "bafyrelinkpreview";

#[derive(Debug, Parser)]
#[command(
    name = "relink",
    version,
    about = "Repair asset paths in static exports served from gateway prefixes"
)]
struct Cli {
    /// Config file for `resolve` and `serve` (defaults to relink.json in the
    /// target directory). `fix-html` needs no configuration.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Rewrite ./ asset references in nested HTML files so they reach the export root.
    FixHtml {
        dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print how each reference resolves under the active rules.
    Resolve {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Serve an export under /ipfs/<cid>/ with the worker in front of it.
    Serve {
        dir: PathBuf,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, default_value = DEFAULT_PREVIEW_CID)]
        cid: String,
        /// Do not re-run the HTML corrector when the export changes.
        #[arg(long = "no-watch", action = ArgAction::SetFalse)]
        watch: bool,
    },
}

pub async fn run_from_env() -> Result<(), String> {
    run_from_args(env::args().skip(1).collect()).await
}

pub async fn run_from_args(args: Vec<String>) -> Result<(), String> {
    let cli = match Cli::try_parse_from(std::iter::once("relink".to_string()).chain(args)) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{err}");
            return Ok(());
        }
        Err(err) => return Err(err.to_string()),
    };
    init_tracing();

    match cli.command {
        CliCommand::FixHtml { dir, dry_run } => run_fix_html(&dir, dry_run),
        CliCommand::Resolve { paths } => {
            let cwd = env::current_dir().map_err(|e| format!("failed to read cwd: {e}"))?;
            let config = load_config(cli.config.as_deref(), &cwd)?;
            for line in resolve_lines(&config.rule_table(), &paths) {
                println!("{line}");
            }
            Ok(())
        }
        CliCommand::Serve {
            dir,
            port,
            cid,
            watch,
        } => {
            let config = load_config(cli.config.as_deref(), &dir)?;
            run_server(dir, port, cid, watch, config).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_config(explicit: Option<&Path>, dir: &Path) -> Result<RelinkConfig, String> {
    match explicit {
        Some(path) => RelinkConfig::load(path).map_err(|e| e.to_string()),
        None => RelinkConfig::load_from_dir(dir).map_err(|e| e.to_string()),
    }
}

fn run_fix_html(dir: &Path, dry_run: bool) -> Result<(), String> {
    let report = correct_tree(dir, &BatchOptions { dry_run }).map_err(|e| e.to_string())?;
    let verb = if dry_run { "would fix" } else { "fixed" };
    for path in &report.files_changed {
        let rel = path.strip_prefix(dir).unwrap_or(path);
        println!("{verb} {}", rel.display());
    }
    println!(
        "{} reference(s) in {} of {} HTML file(s){}",
        report.references,
        report.files_changed.len(),
        report.scanned,
        if dry_run { " (dry run)" } else { "" }
    );
    Ok(())
}

fn resolve_lines(table: &RuleTable, paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .map(|path| {
            let kind = table.classify(path);
            match table.rewrite(path) {
                Some(out) => format!("{path} -> {out} ({kind:?})"),
                None => format!("{path} (unchanged, {kind:?})"),
            }
        })
        .collect()
}

async fn run_server(
    root: PathBuf,
    port: u16,
    cid: String,
    watch: bool,
    config: RelinkConfig,
) -> Result<(), String> {
    let root = root
        .canonicalize()
        .map_err(|e| format!("failed to resolve {}: {e}", root.display()))?;

    let scope = format!("http://localhost:{port}/ipfs/{cid}/");
    let worker = ServiceWorker::new(&scope, config.rule_table())
        .map_err(|e| format!("invalid preview scope {scope}: {e}"))?
        .with_config(config.worker.clone())
        .with_mocks(config.mocks());

    let registrations = config
        .registrations_path
        .clone()
        .unwrap_or_else(|| env::temp_dir().join("relink-registrations.json"));
    let mut store = FileRegistrations::new(registrations);
    let script_url = format!("{scope}{}", config.worker_script);
    let outcome =
        register(&mut store, &script_url, &scope, RULES_VERSION).map_err(|e| e.to_string())?;
    tracing::info!(?outcome, store = %store.path().display(), "worker registration");

    correct_before_serving(&root)?;
    if watch {
        tokio::spawn(ExportWatcher::new(root.clone()).run());
    }

    let app = GatewayAdapter::from_worker(&root, worker).router();
    let host = format!("0.0.0.0:{port}");
    println!("RELINK serve");
    println!("Root:  {}", root.display());
    println!("URL:   {scope}");
    println!("Watch: {}", if watch { "on" } else { "off" });

    let listener = tokio::net::TcpListener::bind(&host)
        .await
        .map_err(|e| format!("failed to bind {host}: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("server failed: {e}"))
}

/// Runs whether or not watch mode is on, so a fresh export is served fixed.
fn correct_before_serving(root: &Path) -> Result<(), String> {
    let report = correct_tree(root, &BatchOptions::default()).map_err(|e| e.to_string())?;
    if !report.files_changed.is_empty() {
        tracing::info!(
            files = report.files_changed.len(),
            references = report.references,
            "corrected nested HTML before serving"
        );
    }
    Ok(())
}
