use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use pike_lsp::analysis::{AnalysisKind, Analyzer};
use pike_lsp::config::Settings;
use pike_lsp::diagnostic::{FileDiagnostic, FileResult, ToolDiagnostic};
use pike_lsp::lsp::{self, LaunchOptions};
use pike_lsp::output::{self, Format, Summary};
use pike_lsp::supervisor::{SpawnConfig, Supervisor};
use pike_lsp::workspace;

#[derive(Parser)]
#[command(name = "pike-lsp", version, about = "Language server for Pike")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the language server over stdio
    Serve(ServeArgs),

    /// Analyze Pike files from the command line
    Check(CheckArgs),

    /// Manage pike-lsp configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the JSON Schema for pike-lsp settings
    Schema,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Pike interpreter to spawn (overrides initializationOptions)
    #[arg(long)]
    pike_path: Option<String>,

    /// Extra argument passed to the interpreter (repeatable)
    #[arg(long = "pike-arg")]
    pike_args: Vec<String>,

    /// Log at debug level
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(clap::Args)]
struct CheckArgs {
    /// Files or directories to analyze (defaults to the current directory)
    files: Vec<PathBuf>,

    /// Pike interpreter to spawn
    #[arg(long, default_value = "pike")]
    pike_path: String,

    /// Extra argument passed to the interpreter (repeatable)
    #[arg(long = "pike-arg")]
    pike_args: Vec<String>,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "human")]
    format: Format,

    /// Print verbose diagnostic information to stderr
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            init_tracing(args.verbose);
            lsp::run_server(LaunchOptions {
                pike_path: args.pike_path,
                pike_args: args.pike_args,
            })
            .await;
            ExitCode::SUCCESS
        }
        Commands::Check(args) => {
            init_tracing(args.verbose);
            run_check(args).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Schema => run_config_schema(),
        },
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "pike-lsp", &mut std::io::stdout());
            ExitCode::SUCCESS
        }
    }
}

/// Logs go to stderr; stdout carries the LSP channel (or JSON output).
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "pike_lsp=debug" } else { "pike_lsp=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_config_schema() -> ExitCode {
    let schema = schemars::schema_for!(Settings);
    println!("{}", serde_json::to_string_pretty(&schema).unwrap());
    ExitCode::SUCCESS
}

async fn run_check(args: CheckArgs) -> ExitCode {
    let start = Instant::now();
    let mut stderr = std::io::stderr().lock();

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            let diag = ToolDiagnostic::error(format!("cannot determine current directory: {e}"));
            let _ = writeln!(stderr, "{:?}", miette::Report::new(diag));
            return ExitCode::from(2);
        }
    };

    // Partition explicit args into directories (walked) and files.
    let mut files_to_check: Vec<PathBuf> = Vec::new();
    let roots: Vec<PathBuf> = if args.files.is_empty() {
        vec![cwd.clone()]
    } else {
        let mut walk_roots = Vec::new();
        for path in &args.files {
            let resolved = if path.is_absolute() {
                path.clone()
            } else {
                cwd.join(path)
            };
            if resolved.is_dir() {
                walk_roots.push(resolved);
            } else {
                files_to_check.push(resolved);
            }
        }
        walk_roots
    };
    for root in &roots {
        tracing::debug!(root = %root.display(), "discovering files");
        let (found, warnings) = workspace::discover_pike_files(root);
        for warning in warnings {
            let diag = ToolDiagnostic::warning(warning);
            let _ = writeln!(stderr, "{:?}", miette::Report::new(diag));
        }
        files_to_check.extend(found);
    }

    if files_to_check.is_empty() {
        if args.format == Format::Human {
            let diag = ToolDiagnostic::warning("no files to check".to_string());
            let _ = writeln!(stderr, "{:?}", miette::Report::new(diag));
        }
        return ExitCode::SUCCESS;
    }

    tracing::debug!(
        files = files_to_check.len(),
        pike = %args.pike_path,
        "starting check run"
    );

    // One interpreter serves the whole run; files go through sequentially
    // since analysis serializes on the child anyway.
    let supervisor = Supervisor::start(SpawnConfig {
        program: args.pike_path.clone(),
        args: args.pike_args.clone(),
        env: Settings::default()
            .child_env()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    });
    if !supervisor.wait_until_running(Duration::from_secs(10)).await {
        supervisor.stop();
        let diag = ToolDiagnostic::error(format!(
            "failed to start pike interpreter '{}'",
            args.pike_path
        ));
        let _ = writeln!(stderr, "{:?}", miette::Report::new(diag));
        return ExitCode::from(2);
    }
    let analyzer = Analyzer::new(supervisor.clone());

    let mut results: Vec<FileResult> = Vec::with_capacity(files_to_check.len());
    let mut sources: Vec<(String, String)> = Vec::new();
    for path in &files_to_check {
        let path_str = path.display().to_string();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                results.push(FileResult::tool_error(&path_str, format!("could not read: {e}")));
                continue;
            }
        };

        let file_start = Instant::now();
        let outcome = analyzer
            .analyze(&content, &path_str, &[AnalysisKind::Diagnostics], None)
            .await;
        match outcome {
            Ok(outcome) => {
                let diagnostics: Vec<FileDiagnostic> = outcome
                    .diagnostics
                    .ok()
                    .map(|diags| diags.iter().map(FileDiagnostic::from_pike).collect())
                    .unwrap_or_default();
                tracing::debug!(
                    file = %path_str,
                    clean = diagnostics.is_empty(),
                    elapsed = ?file_start.elapsed(),
                    "checked"
                );
                results.push(if diagnostics.is_empty() {
                    FileResult::clean(&path_str)
                } else {
                    FileResult::flagged(&path_str, diagnostics)
                });
            }
            Err(e) => {
                results.push(FileResult::tool_error(&path_str, e.to_string()));
            }
        }
        sources.push((path_str, content));
    }

    supervisor.stop();

    let checked = results.len();
    let flagged = results.iter().filter(|r| !r.clean && !r.tool_error).count();
    let clean = results.iter().filter(|r| r.clean).count();
    let total_diagnostics: usize = results
        .iter()
        .filter(|r| !r.tool_error)
        .map(|r| r.diagnostics.len())
        .sum();
    let has_tool_error = results.iter().any(|r| r.tool_error);

    let summary = Summary {
        checked_files: checked,
        clean_files: clean,
        flagged_files: flagged,
        total_diagnostics,
        duration: start.elapsed(),
        has_tool_error,
    };

    let source_map: HashMap<&str, &str> = sources
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_str()))
        .collect();

    match args.format {
        Format::Human => {
            output::render_human(&results, &summary, &source_map, &mut stderr);
        }
        Format::Json => {
            let mut stdout = std::io::stdout().lock();
            output::render_json(&results, &summary, &mut stdout);
        }
    }

    if has_tool_error {
        ExitCode::from(2)
    } else if flagged > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
