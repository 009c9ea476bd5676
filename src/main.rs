//! JNodes CLI
//!
//! Runs the local backend, scans media directories and expands prompts.

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use jnodes::prompts::{parse_dynamic_prompts, parse_wildcards, SelectionMode};
use jnodes::{BackendConfig, NodeError, ProgressReporter, SubdirectoryScanner};

const ABOUT: &str = r#"
JNodes - media node toolkit and local backend

Examples:
  jnodes serve --root /opt/ComfyUI                 serve the backend for a host install
  jnodes scan output --recursive                   list media below output/
  jnodes scan output --json --progress             JSON result, progress on stderr
  jnodes prompt "a {red|blue} __animal__" --seed 7 expand a prompt
"#;

/// Media node toolkit and local backend
#[derive(Parser)]
#[command(name = "jnodes")]
#[command(author, version, about = ABOUT, long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Host root directory, overrides the config
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP backend
    Serve {
        /// Address to bind, overrides the config
        #[arg(short = 'b', long)]
        bind: Option<String>,
    },

    /// List the media below a directory
    Scan {
        /// Directory to scan, relative to the host root
        dir: PathBuf,

        /// Descend into subdirectories
        #[arg(short = 'r', long)]
        recursive: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Report progress on stderr as JSON lines
        #[arg(long)]
        progress: bool,

        /// Minimum interval between progress messages
        #[arg(long, default_value = "200")]
        progress_interval_ms: u64,
    },

    /// Expand wildcards and dynamic prompt groups
    Prompt {
        text: String,

        #[arg(short = 's', long, default_value = "0")]
        seed: u64,

        #[arg(short = 'm', long, value_enum, default_value = "seed")]
        mode: SelectionMode,

        /// Wildcard directory, overrides the config
        #[arg(short = 'w', long)]
        wildcards: Option<PathBuf>,

        /// Use one seed for every group and repeated wildcard
        #[arg(long)]
        same_seed: bool,

        /// Avoid repeating an option within a group
        #[arg(long)]
        enforce_different: bool,
    },
}

fn load_config(cli: &Cli) -> Result<BackendConfig, NodeError> {
    let mut config = match &cli.config {
        Some(path) => BackendConfig::from_file(path)?,
        None => BackendConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.comfy_root = root.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), NodeError> {
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Serve { bind }) => {
            let mut config = config;
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            info!("Host root: {:?}", config.comfy_root);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(jnodes::server::serve(config))
        }
        Some(Commands::Scan {
            dir,
            recursive,
            json,
            progress,
            progress_interval_ms,
        }) => {
            let root = config.comfy_root.join(dir);
            info!("Scanning {:?} (recursive: {})", root, recursive);

            let reporter = Arc::new(ProgressReporter::new(progress, progress_interval_ms));
            reporter.report_start(&root, recursive);

            let callback_reporter = reporter.clone();
            let scanner = SubdirectoryScanner::new(
                root,
                recursive,
                config.scan,
                Arc::new(AtomicBool::new(false)),
            )
            .with_tools(config.tools.clone())
            .with_progress(Box::new(move |p| {
                callback_reporter.report_progress(p);
            }));

            let result = scanner.scan();
            for err in &result.errors {
                reporter.report_error(err);
            }
            reporter.report_done(&result);

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Scan completed:");
                println!("  Items: {}", result.items.len());
                println!("  Images: {}", result.image_count);
                println!("  Videos: {}", result.video_count);
                println!("  Dirs: {}", result.total_dirs);
                println!("  Errors: {}", result.error_count());
                println!("  Duration: {}ms", result.duration_ms);
            }
            Ok(())
        }
        Some(Commands::Prompt {
            text,
            seed,
            mode,
            wildcards,
            same_seed,
            enforce_different,
        }) => {
            let wildcards_dir = wildcards.or_else(|| config.wildcards_dir.clone());
            let text = match wildcards_dir {
                Some(dir) => parse_wildcards(&text, &config.comfy_root.join(dir), mode, seed, same_seed),
                None => text,
            };
            let expanded = parse_dynamic_prompts(&text, mode, seed, same_seed, enforce_different)?;
            println!("{}", expanded);
            Ok(())
        }
        None => {
            println!("{}", ABOUT);
            println!("Run 'jnodes --help' for every option");
            Ok(())
        }
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        error!("{}", e);
        std::process::exit(1);
    }
}
