//! # docchat CLI
//!
//! The `docchat` binary drives the ingestion and retrieval engine. Each
//! namespace is an isolated document library with its own index.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat sync` | Index new documents in the namespace's library |
//! | `docchat status` | Report whether un-indexed changes are pending |
//! | `docchat search "<query>"` | Hybrid retrieval with scores |
//! | `docchat ask "<question>"` | Retrieve context and generate an answer |
//! | `docchat fetch <url>` | Save a page (or crawl a site) into the library |
//! | `docchat delete <source-id>` | Remove a source and unindex it |
//! | `docchat refresh-custom` | Re-embed all injected custom chunks |
//! | `docchat analyze "<query>"` | Show the query analyzer's verdict |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docchat::config::{load_config, Config};
use docchat::models::ChatMessage;
use docchat::sync::Engine;

/// docchat — chat with your documents.
///
/// All commands accept `--config` pointing to a TOML configuration file and
/// `--namespace` selecting the document library to operate on.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Document ingestion and hybrid-retrieval engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docchat.toml")]
    config: PathBuf,

    /// Namespace (document library) to operate on.
    #[arg(long, short, global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index new documents and injected custom chunks.
    ///
    /// Computes the delta against the manifest, extracts, chunks, dedupes,
    /// embeds, persists, and reports what landed and what was skipped.
    Sync,

    /// Report whether the namespace has un-indexed changes.
    Status,

    /// Hybrid search over the index, printing ranked results with scores.
    Search {
        /// The query string.
        query: String,

        /// Number of results.
        #[arg(long)]
        k: Option<usize>,
    },

    /// Ask a question: retrieve context and generate an answer.
    Ask {
        /// The question.
        question: String,
    },

    /// Fetch a URL into the library (PDF saved verbatim, HTML as text).
    Fetch {
        /// The URL to fetch.
        url: String,

        /// Follow same-domain links breadth-first instead of fetching one page.
        #[arg(long)]
        crawl: bool,

        /// Page budget for the crawl.
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// Delete a source: remove its file, manifest entry, and index rows.
    Delete {
        /// Source id (file name in the library).
        source_id: String,
    },

    /// Clear the custom-chunk manifest and re-embed every injected chunk.
    RefreshCustom,

    /// Print the analyzer's classification and recommended weights.
    Analyze {
        /// The query string.
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config: Config = load_config(&cli.config)?;
    let engine = Engine::from_config(config)?;
    let namespace = cli.namespace.as_str();

    match cli.command {
        Commands::Sync => {
            let desired = engine.list_documents(namespace)?;
            let outcome = engine.sync(namespace, &desired).await?;
            let report = &outcome.report;
            println!("sync {}", namespace);
            if report.is_noop() {
                println!("  up to date ({} documents)", desired.len());
            } else {
                println!("  indexed sources: {}", report.indexed.len());
                println!("  custom chunks: {}", report.custom_indexed.len());
                println!("  chunks persisted: {}", report.chunks_persisted);
                println!("  duplicates dropped: {}", report.duplicates_dropped);
                for id in &report.ocr_fallbacks {
                    println!("  ocr fallback: {}", id);
                }
                for skip in &report.skipped {
                    println!(
                        "  skipped: {} [{}] {}",
                        skip.source_id,
                        skip.reason.kind(),
                        skip.reason
                    );
                }
            }
            println!("ok");
        }

        Commands::Status => {
            let current = engine.list_documents(namespace)?;
            let pending = engine.has_pending_changes(namespace, &current)?;
            println!("namespace:  {}", namespace);
            println!("documents:  {}", current.len());
            println!("pending:    {}", pending);
        }

        Commands::Search { query, k } => {
            let (results, analysis) = engine.retrieve(namespace, &query, k).await?;
            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            println!(
                "query type: {} (weights {:.1} semantic / {:.1} lexical)",
                analysis.query_type.as_str(),
                analysis.recommended_weights.semantic,
                analysis.recommended_weights.lexical
            );
            for result in &results {
                println!(
                    "{}. [{:.3}] {} (sem {:.3}, lex {:.3})",
                    result.rank,
                    result.combined_score,
                    result.source_id,
                    result.semantic_score,
                    result.lexical_score
                );
                let excerpt: String = result.text.chars().take(160).collect();
                println!("    \"{}\"", excerpt.replace('\n', " "));
            }
        }

        Commands::Ask { question } => {
            let history: Vec<ChatMessage> = Vec::new();
            let outcome = engine.answer(namespace, &question, &history).await?;
            println!("{}", outcome.answer);
            if !outcome.sources.is_empty() {
                println!();
                println!("sources: {}", outcome.sources.join(", "));
            }
        }

        Commands::Fetch { url, crawl, max_pages } => {
            if crawl {
                let report = engine.crawl_into(namespace, &url, max_pages).await?;
                println!("crawl {}", url);
                println!("  pages visited: {}", report.pages_visited);
                println!("  saved: {}", report.saved.len());
                for (failed_url, error) in &report.failures {
                    println!("  failed: {} ({})", failed_url, error);
                }
            } else {
                match engine.fetch_into(namespace, &url).await? {
                    Some(saved) => println!("saved {}", saved.file_name),
                    None => println!("already saved"),
                }
            }
            println!("run `docchat sync` to index the new documents");
        }

        Commands::Delete { source_id } => {
            let removed = engine.delete_source(namespace, &source_id).await?;
            if removed {
                println!("deleted {}", source_id);
            } else {
                println!("not found: {}", source_id);
            }
        }

        Commands::RefreshCustom => {
            let outcome = engine.force_refresh_custom_chunks(namespace).await?;
            println!("refreshed custom chunks: {}", outcome.report.custom_indexed.len());
            println!("chunks persisted: {}", outcome.report.chunks_persisted);
        }

        Commands::Analyze { query } => {
            let analysis = docchat::analyze::analyze(&query);
            println!("query type:     {}", analysis.query_type.as_str());
            println!("specific terms: {}", analysis.has_specific_terms);
            println!(
                "weights:        {:.1} semantic / {:.1} lexical",
                analysis.recommended_weights.semantic, analysis.recommended_weights.lexical
            );
            println!("length/words:   {}/{}", analysis.query_length, analysis.word_count);
        }
    }

    Ok(())
}
