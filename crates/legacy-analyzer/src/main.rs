use std::path::PathBuf;
use std::sync::Arc;

use analysis_coordination::{
    AnalysisPipeline, CoordinationConfig, PipelineRequest, RequestContext, Specialty,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use legacy_analyzer::config::LlmEndpoint;
use legacy_analyzer::extractor::FsExtractor;
use legacy_analyzer::{files, report, specialists};
use tracing::{info, warn};

/// Multi-specialist analysis of a legacy codebase.
#[derive(Debug, Parser)]
#[command(name = "legacy-analyzer", version)]
struct Args {
    /// Files or directories to analyze.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// What the analysis should focus on.
    #[arg(long)]
    objective: Option<String>,

    /// Comma-separated specialists (security, performance, architecture).
    #[arg(long, value_delimiter = ',', default_value = "security,performance,architecture")]
    specialists: Vec<Specialty>,

    /// Language hint passed to extraction.
    #[arg(long)]
    language: Option<String>,

    /// Maximum concurrent file extractions.
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// TOML file with coordination settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = CoordinationConfig::load(args.config.as_deref())
        .context("Failed to load coordination config")?;
    let endpoint = LlmEndpoint::default();
    info!(url = %endpoint.url, model = %endpoint.model, "Legacy analyzer starting");

    let base = args.paths.first().filter(|p| p.is_dir()).cloned();
    let discovered = files::discover(&args.paths);
    if discovered.is_empty() {
        bail!("No source files found under {:?}", args.paths);
    }
    let mut sources = Vec::with_capacity(discovered.len());
    for path in &discovered {
        match files::load_source(path, base.as_deref()).await {
            Ok(source) => sources.push(source),
            Err(e) => warn!(error = %e, "Skipping file"),
        }
    }
    info!(files = sources.len(), "Loaded sources");

    let mut pipeline = AnalysisPipeline::new(&config, Arc::new(FsExtractor));
    for (specialty, analyzer) in specialists::build_all(&args.specialists, &endpoint)? {
        pipeline = pipeline.with_analyzer(specialty, analyzer);
    }

    let ctx = RequestContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling analysis");
            canceller.cancel();
        }
    });

    let request = PipelineRequest {
        files: sources,
        objective: args.objective,
        specialists: args.specialists,
        language_hint: args.language,
        max_concurrency: args.max_concurrency,
    };
    let report = pipeline
        .run(request, &ctx)
        .await
        .context("Analysis failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print!("{}", report::render_summary(&report));
    }
    Ok(())
}
