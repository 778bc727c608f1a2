//! CLI binary for edgequake-docqa.
//!
//! A thin shim over the library crate that maps CLI flags and environment
//! variables to a `Pipeline` and prints the answer.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_docqa::config::parse_modality_list;
use edgequake_docqa::prompts::load_prompt_template;
use edgequake_docqa::{
    ask, resolve_provider, retrieve_context, Embedder, HttpEmbedder, Modality, OpenSearchConfig,
    OpenSearchIndex, Pipeline, ProviderAnswerClient, ProviderEmbedder, QaConfig, QueryEmbedders,
    RetrievalError,
};
use edgequake_llm::ProviderFactory;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ask a question (OpenSearch + provider from environment)
  docqa "What were Q3 sales in the US?"

  # Favour tables, fetch more candidates, larger context
  docqa --priority table,text,image --k 8 --budget 3000 "Which region grew fastest?"

  # Show the fused context without calling the answer model
  docqa --dry-run "Summarise figure 2"

  # OpenAI-compatible embedding endpoint (e.g. a local server)
  docqa --embed-endpoint http://localhost:8080/v1 --embed-model bge-m3 "..."

  # Machine-readable answer with evidence and timings
  docqa --json "What is the warranty period?" > answer.json

FUSION:
  Each modality's scores are min-max normalised, then blended with rank:
    value = alpha * norm + (1 - alpha) * (1 - (rank - 1) / len)
  Modalities take turns (--priority order) until the --budget is spent.
  Tokens are estimated as ceil(words * 1.3).

ENVIRONMENT VARIABLES:
  OPENSEARCH_HOST / OPENSEARCH_PORT          Vector store endpoint
  OPENSEARCH_INDEX_TEXT|TABLE|IMAGE          Index names per modality
  OPENSEARCH_BASIC_USER / OPENSEARCH_BASIC_PASS
  OPENSEARCH_SIGV4, AWS_REGION               SigV4 is not supported; use a signing proxy
  EDGEQUAKE_LLM_PROVIDER / EDGEQUAKE_MODEL   Answer model
  OPENAI_API_KEY, ANTHROPIC_API_KEY, ...     Provider credentials
  DOCQA_EMBED_ENDPOINT / DOCQA_EMBED_MODEL / DOCQA_EMBED_API_KEY / DOCQA_EMBED_DIMENSIONS
  RUST_LOG                                   Log filter override
"#;

/// Answer questions over indexed PDF text, tables, and figures.
#[derive(Parser, Debug)]
#[command(
    name = "docqa",
    version,
    about = "Answer questions over PDF text, tables, and figures",
    long_about = "Embed a question, retrieve from per-modality OpenSearch k-NN indices, fuse \
the results under a token budget, and generate a grounded answer with any edgequake-llm \
provider (OpenAI, Anthropic, Gemini, Azure OpenAI, Ollama, ...).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// The question to answer.
    question: String,

    /// Neighbours retrieved per modality.
    #[arg(long = "k", env = "DOCQA_K", default_value_t = 5)]
    k: usize,

    /// Weight of the normalised score vs. rank (0.0–1.0).
    #[arg(long, env = "DOCQA_ALPHA", default_value_t = 0.7)]
    alpha: f32,

    /// Token budget for the fused context.
    #[arg(long, env = "DOCQA_BUDGET", default_value_t = 2000)]
    budget: usize,

    /// Modality visiting order, e.g. table,text,image.
    #[arg(long, env = "DOCQA_PRIORITY", default_value = "text,table,image")]
    priority: String,

    /// Characters of each text passage kept in the prompt.
    #[arg(long, env = "DOCQA_MAX_TEXT_CHARS", default_value_t = 1200)]
    max_text_chars: usize,

    /// Deadline for the whole request in seconds.
    #[arg(long, env = "DOCQA_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Answer model ID (e.g. gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Answer provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Max answer tokens.
    #[arg(long, env = "DOCQA_MAX_TOKENS", default_value_t = 1200)]
    max_tokens: usize,

    /// Answer temperature (0.0–2.0).
    #[arg(long, env = "DOCQA_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries on transient model or embedding failures.
    #[arg(long, env = "DOCQA_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Path to a prompt template containing {{CONTEXT}} and {{QUESTION}}.
    #[arg(long, env = "DOCQA_PROMPT_TEMPLATE")]
    prompt_template: Option<PathBuf>,

    /// OpenAI-compatible embeddings base URL. Without it the embedding
    /// provider is auto-detected from the environment.
    #[arg(long, env = "DOCQA_EMBED_ENDPOINT")]
    embed_endpoint: Option<String>,

    /// Embedding model used with --embed-endpoint.
    #[arg(long, env = "DOCQA_EMBED_MODEL", default_value = "text-embedding-3-small")]
    embed_model: String,

    /// Bearer token for --embed-endpoint.
    #[arg(long, env = "DOCQA_EMBED_API_KEY", hide_env_values = true)]
    embed_api_key: Option<String>,

    /// Requested embedding dimensions (must match the indices).
    #[arg(long, env = "DOCQA_EMBED_DIMENSIONS")]
    embed_dimensions: Option<usize>,

    /// OpenSearch host name, without scheme.
    #[arg(long, env = "OPENSEARCH_HOST", default_value = "localhost")]
    opensearch_host: String,

    #[arg(long, env = "OPENSEARCH_PORT", default_value_t = 443)]
    opensearch_port: u16,

    /// Use plain HTTP instead of HTTPS.
    #[arg(long, env = "OPENSEARCH_NO_TLS")]
    opensearch_no_tls: bool,

    /// Skip TLS certificate verification.
    #[arg(long, env = "OPENSEARCH_INSECURE")]
    opensearch_insecure: bool,

    #[arg(long, env = "OPENSEARCH_INDEX_TEXT", default_value = "text-index")]
    index_text: String,

    #[arg(long, env = "OPENSEARCH_INDEX_TABLE", default_value = "table-index")]
    index_table: String,

    #[arg(long, env = "OPENSEARCH_INDEX_IMAGE", default_value = "image-index")]
    index_image: String,

    #[arg(long, env = "OPENSEARCH_BASIC_USER")]
    opensearch_user: Option<String>,

    #[arg(long, env = "OPENSEARCH_BASIC_PASS", hide_env_values = true)]
    opensearch_password: Option<String>,

    /// Request AWS SigV4 signing (rejected; use a signing proxy).
    #[arg(long, env = "OPENSEARCH_SIGV4")]
    sigv4: bool,

    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Print the fused context instead of calling the answer model.
    #[arg(long, env = "DOCQA_DRY_RUN")]
    dry_run: bool,

    /// Output the full Answer (or context, with --dry-run) as JSON.
    #[arg(long, env = "DOCQA_JSON")]
    json: bool,

    /// Disable the spinner.
    #[arg(long, env = "DOCQA_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCQA_VERBOSE")]
    verbose: bool,

    /// Suppress all output except the answer and errors.
    #[arg(short, long, env = "DOCQA_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO logs would fight with the spinner; it covers the same ground.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build pipeline ───────────────────────────────────────────────────
    let config = build_config(&cli).await?;
    let indices = OpenSearchIndex::connect(&opensearch_config(&cli))
        .context("Failed to configure OpenSearch")?;
    let embedders = QueryEmbedders::shared(build_embedder(&cli)?);
    let pipeline = if cli.dry_run {
        Pipeline::retrieval_only(embedders, indices, config)
    } else {
        let provider = resolve_provider(cli.provider.as_deref(), cli.model.as_deref())
            .context("Failed to resolve answer provider")?;
        let answer = Arc::new(ProviderAnswerClient::new(provider, &config));
        Pipeline::new(embedders, indices, answer, config)
    }
    .context("Invalid configuration")?;

    let spinner = show_progress.then(|| spinner(if cli.dry_run { "Retrieving…" } else { "Answering…" }));

    // ── Dry run: context only ────────────────────────────────────────────
    if cli.dry_run {
        let result = retrieve_context(&cli.question, &pipeline).await;
        if let Some(ref s) = spinner {
            s.finish_and_clear();
        }
        let ctx = result.context("Retrieval failed")?;
        report_failures(&ctx.failures, cli.quiet);

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&ctx).context("Failed to serialise context")?
            );
        } else {
            println!("\n=== CONTEXT ===\n");
            println!("{}", ctx.payload.render(pipeline.config().max_text_chars));
            if !cli.quiet {
                eprintln!(
                    "{}",
                    dim(&format!(
                        "{} records ({}), ~{} tokens, {}ms",
                        ctx.fused.len(),
                        describe_counts(ctx.fused.modality_counts()),
                        ctx.fused.total_tokens(),
                        ctx.stats.total_duration_ms
                    ))
                );
            }
        }
        return Ok(());
    }

    // ── Ask ──────────────────────────────────────────────────────────────
    let result = ask(&cli.question, &pipeline).await;
    if let Some(ref s) = spinner {
        s.finish_and_clear();
    }
    let answer = result.context("Question answering failed")?;
    report_failures(&answer.failures, cli.quiet);

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&answer).context("Failed to serialise answer")?
        );
    } else {
        println!("\n=== ANSWER ===\n");
        println!("{}", answer.text.trim_end());
        if !cli.quiet {
            eprintln!(
                "\n{}",
                dim(&format!(
                    "{} context records ({}), ~{} tokens, {}ms total",
                    answer.fused.len(),
                    describe_counts(answer.fused.modality_counts()),
                    answer.stats.context_tokens,
                    answer.stats.total_duration_ms
                ))
            );
        }
    }

    Ok(())
}

fn spinner(message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
    );
    bar.set_prefix("docqa");
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn report_failures(failures: &[RetrievalError], quiet: bool) {
    if quiet {
        return;
    }
    for failure in failures {
        eprintln!("{} {}", yellow("⚠"), failure);
    }
    if !failures.is_empty() {
        eprintln!(
            "{}",
            dim("  The answer was generated without the modalities above.")
        );
    }
}

fn describe_counts(counts: &BTreeMap<Modality, usize>) -> String {
    counts
        .iter()
        .map(|(m, n)| format!("{m}: {}", bold(&n.to_string())))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map CLI args to `QaConfig`.
async fn build_config(cli: &Cli) -> Result<QaConfig> {
    let priority = parse_modality_list(&cli.priority).context("Invalid --priority")?;

    let mut builder = QaConfig::builder()
        .alpha(cli.alpha)
        .token_budget(cli.budget)
        .modality_priority(priority)
        .per_modality_k(cli.k)
        .max_text_chars(cli.max_text_chars)
        .request_timeout_secs(cli.timeout)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .max_retries(cli.max_retries);

    if let Some(ref path) = cli.prompt_template {
        let template = load_prompt_template(path)
            .await
            .with_context(|| format!("Failed to load prompt template from {:?}", path))?;
        builder = builder.prompt_template(template);
    }

    builder.build().context("Invalid configuration")
}

fn opensearch_config(cli: &Cli) -> OpenSearchConfig {
    OpenSearchConfig {
        host: cli.opensearch_host.clone(),
        port: cli.opensearch_port,
        use_tls: !cli.opensearch_no_tls,
        accept_invalid_certs: cli.opensearch_insecure,
        index_names: BTreeMap::from([
            (Modality::Text, cli.index_text.clone()),
            (Modality::Table, cli.index_table.clone()),
            (Modality::Image, cli.index_image.clone()),
        ]),
        basic_user: cli.opensearch_user.clone(),
        basic_password: cli.opensearch_password.clone(),
        sigv4: cli.sigv4,
        region: cli.region.clone(),
        timeout_secs: cli.timeout,
        ..OpenSearchConfig::default()
    }
}

/// HTTP embedder when an endpoint is given, otherwise the provider's.
fn build_embedder(cli: &Cli) -> Result<Arc<dyn Embedder>> {
    if let Some(ref endpoint) = cli.embed_endpoint {
        let key = cli
            .embed_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        let embedder = HttpEmbedder::new(
            key.as_deref(),
            endpoint,
            cli.embed_model.clone(),
            cli.embed_dimensions,
            Duration::from_secs(cli.timeout),
        )
        .context("Failed to configure embedding endpoint")?
        .max_retries(cli.max_retries);
        return Ok(Arc::new(embedder));
    }

    let (_llm, embedding) = ProviderFactory::from_env().map_err(|e| {
        anyhow::anyhow!(
            "No embedding provider could be auto-detected from environment.\n\
             Set OPENAI_API_KEY or pass --embed-endpoint.\n\
             Error: {e}"
        )
    })?;
    Ok(Arc::new(ProviderEmbedder::new(embedding)))
}
