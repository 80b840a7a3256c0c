use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slmbench_benchmark::{
    load_dataset, unix_timestamp, BenchmarkEvent, BenchmarkRunner, ComparisonAdviser,
    InferenceBackend, MemoryProbe, OllamaClient, ResultStore, RunAggregator, RunSettings,
    SysinfoProbe,
};
use slmbench_core::{normalize_host, ComparisonReport, RunSummary, SlmBenchConfig, SlmBenchError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slmbench")]
#[command(about = "SLM-Bench - efficiency benchmark for small language models served by Ollama", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    /// Ollama host URL (overrides OLLAMA_HOST)
    #[arg(long, global = true)]
    ollama_host: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark (default when no command is given)
    Run(RunArgs),

    /// List installed models
    Models,

    /// Check the connection to Ollama
    Status,
}

#[derive(Args, Debug, Default, Clone)]
struct RunArgs {
    /// Model name, or `all` for every supported model
    #[arg(short, long)]
    model: Option<String>,

    /// Path to the benchmark dataset
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Max tokens per inference (default: each item's own budget)
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Max retries for failed inferences
    #[arg(long)]
    max_retries: Option<u32>,

    /// Model used for the cross-model comparison
    #[arg(long)]
    analysis_model: Option<String>,

    /// Directory for JSON results and the CSV log
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Per-inference timeout in seconds (default: none)
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl RunArgs {
    /// Fills flags missing here from `base`; values set here win.
    fn or(self, base: RunArgs) -> RunArgs {
        RunArgs {
            model: self.model.or(base.model),
            data_path: self.data_path.or(base.data_path),
            max_tokens: self.max_tokens.or(base.max_tokens),
            temperature: self.temperature.or(base.temperature),
            max_retries: self.max_retries.or(base.max_retries),
            analysis_model: self.analysis_model.or(base.analysis_model),
            results_dir: self.results_dir.or(base.results_dir),
            timeout_secs: self.timeout_secs.or(base.timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_cancellation(&e) => {
            println!();
            println!("run aborted by user");
            ExitCode::from(130)
        }
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = match verbose {
        true => "slmbench=debug",
        false => "slmbench=info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_cancellation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<SlmBenchError>()
        .is_some_and(SlmBenchError::is_cancellation)
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = SlmBenchConfig::from_env().context("cannot start")?;
    if let Some(host) = &cli.ollama_host {
        config.ollama.host = normalize_host(host);
    }

    match cli.command {
        Some(Commands::Models) => cmd_models(&config).await,
        Some(Commands::Status) => cmd_status(&config).await,
        Some(Commands::Run(args)) => {
            let args = args.or(cli.run);
            cmd_run(apply_run_args(config, &args), &args).await
        }
        None => cmd_run(apply_run_args(config, &cli.run), &cli.run).await,
    }
}

fn apply_run_args(mut config: SlmBenchConfig, args: &RunArgs) -> SlmBenchConfig {
    let defaults = &mut config.defaults;
    if let Some(model) = &args.model {
        defaults.model = model.clone();
    }
    if let Some(path) = &args.data_path {
        defaults.data_path = path.clone();
    }
    if args.max_tokens.is_some() {
        defaults.max_tokens = args.max_tokens;
    }
    if let Some(temperature) = args.temperature {
        defaults.temperature = temperature;
    }
    if let Some(retries) = args.max_retries {
        defaults.max_retries = retries;
    }
    if let Some(model) = &args.analysis_model {
        defaults.analysis_model = model.clone();
    }
    if let Some(dir) = &args.results_dir {
        defaults.results_dir = dir.clone();
    }
    if args.timeout_secs.is_some() {
        config.ollama.request_timeout_secs = args.timeout_secs;
    }
    config
}

fn resolve_models(config: &SlmBenchConfig) -> Vec<String> {
    match config.defaults.model.eq_ignore_ascii_case("all") {
        true => config.supported_models.clone(),
        false => vec![config.defaults.model.clone()],
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting run");
            token.cancel();
        }
    });
    cancel
}

async fn cmd_run(config: SlmBenchConfig, args: &RunArgs) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let backend: Arc<dyn InferenceBackend> = Arc::new(OllamaClient::new(&config.ollama.host));
    let probe: Arc<dyn MemoryProbe> = Arc::new(SysinfoProbe::new());
    let settings = RunSettings::from_config(&config);
    let runner = BenchmarkRunner::new(backend.clone(), probe, settings);
    let store = ResultStore::new(&config.defaults.results_dir);

    runner.check_connection(&cancel).await.context("cannot start")?;

    let models = resolve_models(&config);
    if models.len() > 1 {
        println!("Testing all {} models: {}", models.len(), models.join(", "));
        println!();
    }

    let items = load_dataset(&config.defaults.data_path).context("cannot start")?;
    info!(max_tokens = ?args.max_tokens, "Run configured");

    let mut summaries: Vec<RunSummary> = Vec::new();
    let mut total_runs = 0;

    for model in &models {
        print_banner(&format!("Testing Model: {}", model));

        match runner.verify_model(model, &cancel).await {
            Ok(readiness) => {
                println!("Model ready in {:.2}s", readiness.load_time);
                println!(
                    "  Memory delta: {:+.3} GB | Peak: {:.3} GB",
                    readiness.memory_delta_gb, readiness.peak_memory_gb
                );
            }
            Err(e) if e.is_cancellation() => return Err(e.into()),
            Err(e) => {
                println!("Skipping {}: {}", model, e);
                println!();
                continue;
            }
        }

        println!();
        println!("Starting benchmark on {} items...", items.len());
        println!();

        let (tx, rx) = unbounded_channel();
        let (results, ()) = tokio::join!(
            async {
                let results = runner.run_model(model, &items, &cancel, &tx).await;
                drop(tx);
                results
            },
            print_events(rx)
        );
        let results = results?;

        let summary =
            RunAggregator::summarize(model, &results, &runner.settings().run_config(), unix_timestamp());
        let json_path = store.save_run(&summary, &results)?;
        store.append_csv(&summary)?;
        print_model_summary(&summary, &json_path);

        total_runs += results.len();
        summaries.push(summary);
    }

    let comparison_path = match summaries.len() >= 2 {
        true => {
            let adviser = ComparisonAdviser::new(backend, &config.defaults.analysis_model)
                .with_temperature(config.defaults.analysis_temperature);
            print_banner(&format!(
                "Generating comparison using {}",
                config.defaults.analysis_model
            ));
            let report = adviser.compare(&summaries, unix_timestamp(), &cancel).await?;
            let path = store.save_comparison(&report)?;
            print_comparison(&report, &path);
            Some(path)
        }
        false => None,
    };

    println!();
    println!("{:=<60}", "");
    println!("All Benchmarks Complete!");
    println!("{:=<60}", "");
    println!("Models Tested:   {}", models.len());
    println!("Total Runs:      {}", total_runs);
    println!();
    println!("Summary log:  {}", store.csv_path().display());
    if let Some(path) = comparison_path {
        println!("Comparison:   {}", path.display());
    }

    Ok(())
}

async fn print_events(mut rx: UnboundedReceiver<BenchmarkEvent>) {
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }
}

fn print_event(event: &BenchmarkEvent) {
    match event {
        BenchmarkEvent::ItemStarted {
            current,
            total,
            preview,
            ..
        } => println!("[{}/{}] Processing: {}", current, total, preview),
        BenchmarkEvent::Retrying {
            attempt,
            max_retries,
            error,
            ..
        } => {
            println!("   Attempt {} failed: {}", attempt, error);
            println!("   Retrying ({}/{})...", attempt, max_retries);
        }
        BenchmarkEvent::ItemCompleted { result, .. } => {
            let m = &result.metrics;
            println!(
                "   ✓ {} tokens | {:.1} tok/s | TTFT: {:.3}s",
                m.output_tokens,
                m.tokens_per_second,
                m.ttft.unwrap_or(0.0)
            );
        }
        BenchmarkEvent::ItemFailed {
            attempts, result, ..
        } => println!(
            "   ✗ Giving up after {} attempt(s) [{}]: {}",
            attempts,
            result.metrics.status.as_str(),
            result.metrics.error.as_deref().unwrap_or("unknown error")
        ),
        BenchmarkEvent::Cancelled { model, completed } => {
            println!();
            println!("Stopping {} after {} completed items", model, completed);
        }
    }
}

fn print_banner(title: &str) {
    println!();
    println!("{:=<60}", "");
    println!("{}", title);
    println!("{:=<60}", "");
    println!();
}

fn print_model_summary(summary: &RunSummary, json_path: &Path) {
    println!();
    println!("{:-<60}", "");
    println!("Summary for {}:", summary.model);
    println!("{:-<60}", "");
    println!("Total Items:     {}", summary.total_items);
    println!("Successful:      {}", summary.successful);
    println!("Failed:          {}", summary.failed);

    if let Some(perf) = &summary.performance {
        println!("Avg TPS:         {:.2} tokens/sec", perf.avg_tokens_per_second);
        println!(
            "  Range:         {:.2} - {:.2}",
            perf.min_tokens_per_second, perf.max_tokens_per_second
        );
        println!("Avg Decode TPS:  {:.2} tokens/sec", perf.avg_decode_tps);
        println!("Avg TTFT:        {:.3} sec", perf.avg_ttft);
        println!("  Range:         {:.3} - {:.3}", perf.min_ttft, perf.max_ttft);
        println!("Success Rate:    {:.1}%", summary.success_rate * 100.0);
        println!("Total Tokens:    {}", perf.total_tokens_generated);
    }

    if !summary.category_breakdown.is_empty() {
        println!("By Category:");
        for (category, stats) in &summary.category_breakdown {
            println!("  {:<18} {:>3} items | {:.2} tok/s", category, stats.count, stats.avg_tps);
        }
    }

    println!();
    println!("Results saved: {}", json_path.display());
    if !summary.failed_items.is_empty() {
        println!("Failed items: {}", summary.failed_items.join(", "));
    }
}

fn print_comparison(report: &ComparisonReport, path: &Path) {
    if report.is_degraded() {
        println!(
            "Analysis generation failed: {}",
            report.meta.error.as_deref().unwrap_or("unknown error")
        );
        println!("Raw summaries saved: {}", path.display());
        return;
    }

    if let Some(note) = &report.meta.note {
        println!("Note: {}", note);
    }
    println!("Analysis saved: {}", path.display());

    match &report.analysis.structured {
        Some(verdict) if !verdict.ranking.is_null() => {
            println!();
            println!("Quick Insights:");
            println!("   Ranking: {}", verdict.ranking);
            if !verdict.winner.is_null() {
                println!("   Winner: {}", verdict.winner);
            }
        }
        _ => println!("Analysis generated (see 'readable' field in comparison file)"),
    }
}

async fn cmd_models(config: &SlmBenchConfig) -> Result<()> {
    let client = OllamaClient::new(&config.ollama.host);
    let models = client.list_models().await.context("cannot start")?;

    println!();
    println!("Installed Models:");
    println!("{:-<50}", "");
    println!("  {:<4} {:<30} {}", "#", "Name", "Supported");
    println!("{:-<50}", "");
    for (i, name) in models.iter().enumerate() {
        let supported = config
            .supported_models
            .iter()
            .any(|m| name.contains(m.as_str()));
        println!(
            "  {:<4} {:<30} {}",
            i + 1,
            name,
            if supported { "yes" } else { "-" }
        );
    }
    println!();

    Ok(())
}

async fn cmd_status(config: &SlmBenchConfig) -> Result<()> {
    println!("System Status:");
    println!("{:-<40}", "");
    println!("  Ollama Host: {}", config.ollama.host);

    let client = OllamaClient::new(&config.ollama.host);
    match client.list_models().await {
        Ok(models) => {
            println!("  Ollama: connected ({} models available)", models.len());
        }
        Err(e) => {
            println!("  Ollama: disconnected ({})", e);
        }
    }
    println!("  Dataset: {}", config.defaults.data_path.display());
    println!("  Results: {}", config.defaults.results_dir.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_runs_with_top_level_flags() {
        let cli = Cli::try_parse_from(["slmbench", "--model", "all", "--max-tokens", "64"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.model.as_deref(), Some("all"));
        assert_eq!(cli.run.max_tokens, Some(64));
    }

    #[test]
    fn test_run_subcommand_flags() {
        let cli = Cli::try_parse_from([
            "slmbench",
            "run",
            "--model",
            "gemma:2b",
            "--temperature",
            "0.2",
            "--timeout-secs",
            "30",
            "--verbose",
        ])
        .unwrap();

        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.model.as_deref(), Some("gemma:2b"));
        assert_eq!(args.temperature, Some(0.2));
        assert_eq!(args.timeout_secs, Some(30));
        assert!(cli.verbose);
    }

    #[test]
    fn test_flags_before_run_subcommand_are_kept() {
        let cli = Cli::try_parse_from([
            "slmbench", "--model", "llama3", "--max-tokens", "32", "run", "--max-tokens", "64",
        ])
        .unwrap();

        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        let args = args.or(cli.run);
        assert_eq!(args.model.as_deref(), Some("llama3"));
        assert_eq!(args.max_tokens, Some(64));

        let config = apply_run_args(SlmBenchConfig::default(), &args);
        assert_eq!(config.defaults.model, "llama3");
        assert_eq!(config.defaults.max_tokens, Some(64));
    }

    #[test]
    fn test_flags_override_config() {
        let args = RunArgs {
            model: Some("llama3".to_string()),
            max_tokens: Some(200),
            max_retries: Some(0),
            results_dir: Some(PathBuf::from("out")),
            timeout_secs: Some(45),
            ..RunArgs::default()
        };

        let config = apply_run_args(SlmBenchConfig::default(), &args);
        assert_eq!(config.defaults.model, "llama3");
        assert_eq!(config.defaults.max_tokens, Some(200));
        assert_eq!(config.defaults.max_retries, 0);
        assert_eq!(config.defaults.results_dir, PathBuf::from("out"));
        assert_eq!(config.ollama.request_timeout_secs, Some(45));
        assert_eq!(config.defaults.temperature, 0.7);
    }

    #[test]
    fn test_resolve_models() {
        let mut config = SlmBenchConfig::default();
        config.defaults.model = "ALL".to_string();
        assert_eq!(resolve_models(&config), vec!["phi3", "llama3", "gemma:2b"]);

        config.defaults.model = "phi3".to_string();
        assert_eq!(resolve_models(&config), vec!["phi3"]);
    }

    #[test]
    fn test_cancellation_is_detected_through_context() {
        let err = anyhow::Error::new(SlmBenchError::Cancelled).context("benchmark pass");
        assert!(is_cancellation(&err));

        let err = anyhow::Error::new(SlmBenchError::Connection("refused".into())).context("cannot start");
        assert!(!is_cancellation(&err));
        assert!(format!("{:#}", err).starts_with("cannot start: "));
    }
}
