use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::{render, server};
use finrag_core::config;
use finrag_core::ingest::{parse_symbols, IngestRequest};
use finrag_core::pipeline::{self, AskOptions, IngestSummary, Services};
use providers::alphavantage::AvClient;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest {
            stocks,
            crypto,
            market,
            days,
            no_overview,
            no_earnings,
            news,
            api_key,
            json,
        } => {
            let request = IngestRequest {
                stocks: parse_symbols(&stocks),
                crypto: parse_symbols(&crypto),
                market,
                days: days as usize,
                include_overview: !no_overview,
                include_earnings: !no_earnings,
                include_news: news,
            };
            let client = AvClient::new(cfg.alpha_vantage.client_config(api_key.as_deref()))?;
            let services = Services::connect(cfg).await?;
            let summary = pipeline::ingest(&services, &client, request).await?;
            print_summary("ingest", &summary, json)
        }
        Commands::Reindex { json } => {
            let services = Services::connect(cfg).await?;
            let summary = pipeline::reindex(&services).await?;
            print_summary("reindex", &summary, json)
        }
        Commands::Ask {
            question,
            k,
            symbol,
            max_new_tokens,
            json,
            plain,
        } => {
            let services = Services::connect(cfg).await?;
            let opts = AskOptions {
                k,
                symbol,
                max_new_tokens,
            };
            let answer = pipeline::ask(&services, &question, &opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print!("{}", render::render_answer(&answer, plain));
            }
            Ok(())
        }
        Commands::Search { query, k, symbol } => {
            let services = Services::connect(cfg).await?;
            let hits = pipeline::search(&services, &query, k, symbol.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
            Ok(())
        }
        Commands::Symbols => {
            let services = Services::connect(cfg).await?;
            for sym in pipeline::symbols(&services).await? {
                println!("{}", sym);
            }
            Ok(())
        }
        Commands::Clear => {
            let services = Services::connect(cfg).await?;
            let summary = pipeline::clear(&services).await?;
            println!(
                "cleared {} chunks and {} documents",
                summary.chunks, summary.documents
            );
            Ok(())
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
            let services = Services::connect(cfg).await?;
            server::serve(services, &bind).await
        }
    }
}

#[derive(Parser)]
#[command(name = "finrag")]
#[command(about = "Finance & crypto question answering over Alpha Vantage data", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch market data, store it and rebuild the index
    Ingest {
        /// Stock symbols (comma-separated)
        #[arg(long, default_value = "AAPL,MSFT")]
        stocks: String,
        /// Crypto symbols (comma-separated)
        #[arg(long, default_value = "BTC,ETH")]
        crypto: String,
        /// Quote market for crypto pairs
        #[arg(long, default_value = "USD")]
        market: String,
        /// Max trading days per symbol
        #[arg(
            long,
            default_value_t = 365,
            value_parser = clap::value_parser!(u64).range(30..=2000)
        )]
        days: u64,
        /// Skip company overviews
        #[arg(long)]
        no_overview: bool,
        /// Skip earnings
        #[arg(long)]
        no_earnings: bool,
        /// Include news sentiment for the stock symbols
        #[arg(long)]
        news: bool,
        /// Alpha Vantage key; overrides config and ALPHA_VANTAGE_KEY
        #[arg(long)]
        api_key: Option<String>,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the index from stored documents
    Reindex {
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Answer a question from the indexed data
    Ask {
        question: String,
        /// Chunks to retrieve before reordering
        #[arg(short, long)]
        k: Option<usize>,
        /// Bias retrieval towards one ticker
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        max_new_tokens: Option<u32>,
        /// Output JSON
        #[arg(long)]
        json: bool,
        /// No terminal emphasis
        #[arg(long)]
        plain: bool,
    },
    /// Nearest chunks for a query, as JSON
    Search {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long)]
        symbol: Option<String>,
    },
    /// List symbols present in the index
    Symbols,
    /// Delete the index and stored documents
    Clear,
    /// Run the HTTP API
    Serve {
        /// Address to bind, e.g. 127.0.0.1:8080
        #[arg(long)]
        bind: Option<String>,
    },
}

fn print_summary(label: &str, summary: &IngestSummary, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "status": "ok",
            "mode": label,
            "documents": summary.documents,
            "chunks": summary.chunks,
            "symbols": summary.symbols,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "{}: {} documents, {} chunks, symbols {}",
            label,
            summary.documents,
            summary.chunks,
            summary.symbols.join(",")
        );
    }
    Ok(())
}
