use finrag_core::config::{AppConfig, DatabaseConfig, EmbeddingConfig};
use finrag_core::ingest::{IngestRequest, MarketData};
use finrag_core::pipeline::{self, AskOptions, Services};
use providers::{GenerationOptions, LlmProvider, ProviderError};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct FakeMarket {
    rate_limited: bool,
}

#[async_trait::async_trait]
impl MarketData for FakeMarket {
    async fn overview(&self, symbol: &str) -> anyhow::Result<Value> {
        Ok(json!({
            "Symbol": symbol,
            "Name": "Apple Inc",
            "Sector": "TECHNOLOGY",
            "Industry": "ELECTRONIC COMPUTERS",
            "Address": "ONE APPLE PARK WAY, CUPERTINO, CA, US"
        }))
    }

    async fn daily_adjusted(&self, _symbol: &str, _outputsize: &str) -> anyhow::Result<Value> {
        Ok(json!({
            "Meta Data": { "2. Symbol": "AAPL" },
            "Time Series (Daily)": {
                "2024-01-04": { "1. open": "182.15", "2. high": "183.09", "3. low": "180.88",
                                "4. close": "181.91", "6. volume": "71983600" },
                "2024-01-05": { "1. open": "181.99", "2. high": "182.76", "3. low": "180.17",
                                "4. close": "181.18", "6. volume": "62303300" }
            }
        }))
    }

    async fn earnings(&self, symbol: &str) -> anyhow::Result<Value> {
        Ok(json!({ "symbol": symbol, "annualEarnings": [{ "fiscalDateEnding": "2023-09-30" }] }))
    }

    async fn crypto_daily(&self, symbol: &str, _market: &str) -> anyhow::Result<Value> {
        if self.rate_limited {
            return Err(ProviderError::RateLimited(
                "Alpha Vantage rate limit: retries exceeded".into(),
            )
            .into());
        }
        let close = if symbol == "BTC" { "44145.11" } else { "2269.90" };
        Ok(json!({
            "Time Series (Digital Currency Daily)": {
                "2024-01-05": { "1. open": "44151.10", "2. high": "44357.46", "3. low": "42450.00",
                                "4. close": close, "5. volume": "48038.06" },
                "2024-01-04": { "1. open": "42836.87", "2. high": "44729.58", "3. low": "42630.00",
                                "4. close": close, "5. volume": "48215.09" }
            }
        }))
    }

    async fn news(&self, _tickers_csv: &str, _limit: u32) -> anyhow::Result<Value> {
        Ok(json!({ "feed": [] }))
    }
}

struct Scripted {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl LlmProvider for Scripted {
    async fn generate(
        &self,
        prompt: &str,
        _opts: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.reply.clone())
    }
}

fn test_config(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            path: dir.join("finrag.db").to_string_lossy().into_owned(),
        },
        embeddings: EmbeddingConfig {
            dimensions: 2048,
            ..EmbeddingConfig::default()
        },
        ..AppConfig::default()
    }
}

fn crypto_request() -> IngestRequest {
    IngestRequest {
        crypto: vec!["btc".into(), "eth".into()],
        days: 30,
        ..IngestRequest::default()
    }
}

#[tokio::test]
async fn ingest_then_ask_falls_back_to_extraction() {
    let temp = tempdir().unwrap();
    let cfg = test_config(temp.path());
    let services = Services::connect_with_registry(
        cfg.clone(),
        pipeline::build_registry_with_env(&cfg, |_| None),
    )
    .await
    .unwrap();

    let market = FakeMarket { rate_limited: false };
    let summary = pipeline::ingest(&services, &market, crypto_request()).await.unwrap();
    assert_eq!(summary.documents, 4);
    assert_eq!(summary.chunks, 4);
    assert_eq!(summary.symbols, vec!["BTC", "ETH"]);
    assert_eq!(pipeline::symbols(&services).await.unwrap(), vec!["BTC", "ETH"]);

    let answer = pipeline::ask(
        &services,
        "What was the close?",
        &AskOptions {
            symbol: Some("btc".into()),
            ..AskOptions::default()
        },
    )
    .await
    .unwrap();
    assert!(answer.fallback);
    assert_eq!(answer.text, "BTC close price: 44145.11");
    assert_eq!(answer.sources.len(), 4);
    assert!(answer.sources[0].meta.doc_id.starts_with("av/BTC-USD/"));
}

#[tokio::test]
async fn generated_answer_is_kept_unless_it_is_only_citations() {
    let temp = tempdir().unwrap();
    let mut cfg = test_config(temp.path());
    cfg.generation.provider = "scripted".into();

    for (reply, expect_fallback) in [("BTC closed at 44145.11.", false), ("[1], [2]", true)] {
        let llm = Arc::new(Scripted {
            reply: reply.into(),
            prompts: Mutex::new(Vec::new()),
        });
        let registry =
            pipeline::build_registry_with_env(&cfg, |_| None).with_llm("scripted", llm.clone());
        let services = Services::connect_with_registry(cfg.clone(), registry).await.unwrap();
        pipeline::ingest(&services, &FakeMarket { rate_limited: false }, crypto_request())
            .await
            .unwrap();

        let answer = pipeline::ask(&services, "BTC close price?", &AskOptions::default())
            .await
            .unwrap();
        assert_eq!(answer.fallback, expect_fallback, "reply {:?}", reply);
        if !expect_fallback {
            assert_eq!(answer.text, reply);
        }
        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with("Extract the price from this data: "));
        assert!(prompts[0].ends_with("Question: BTC close price?\nAnswer:"));
    }
}

#[tokio::test]
async fn reindex_and_clear_use_stored_documents() {
    let temp = tempdir().unwrap();
    let cfg = test_config(temp.path());
    let services = Services::connect(cfg.clone()).await.unwrap();
    let request = IngestRequest {
        stocks: vec!["AAPL".into()],
        days: 30,
        ..IngestRequest::default()
    };
    let ingested = pipeline::ingest(&services, &FakeMarket { rate_limited: false }, request)
        .await
        .unwrap();
    // overview + two bars + earnings
    assert_eq!(ingested.documents, 4);

    let reindexed = pipeline::reindex(&services).await.unwrap();
    assert_eq!(reindexed, ingested);

    let hits = pipeline::search(&services, "AAPL company overview sector", Some(2), None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].score <= hits[1].score);

    let cleared = pipeline::clear(&services).await.unwrap();
    assert_eq!(cleared.chunks, 4);
    assert_eq!(cleared.documents, 4);
    assert!(pipeline::symbols(&services).await.unwrap().is_empty());
    assert_eq!(pipeline::reindex(&services).await.unwrap().documents, 0);
}

#[tokio::test]
async fn failed_fetch_keeps_previous_index() {
    let temp = tempdir().unwrap();
    let cfg = test_config(temp.path());
    let services = Services::connect(cfg).await.unwrap();
    pipeline::ingest(&services, &FakeMarket { rate_limited: false }, crypto_request())
        .await
        .unwrap();

    let err = pipeline::ingest(&services, &FakeMarket { rate_limited: true }, crypto_request())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rate limit"));
    assert_eq!(pipeline::symbols(&services).await.unwrap(), vec!["BTC", "ETH"]);
}

#[tokio::test]
async fn ask_on_empty_index_says_it_does_not_know() {
    let temp = tempdir().unwrap();
    let services = Services::connect(test_config(temp.path())).await.unwrap();
    let answer = pipeline::ask(&services, "What was BTC close?", &AskOptions::default())
        .await
        .unwrap();
    assert_eq!(answer.text, "I don't know.");
    assert!(answer.sources.is_empty());
    assert!(pipeline::ask(&services, "   ", &AskOptions::default()).await.is_err());
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[tokio::test]
async fn search_warns_when_index_model_differs() {
    let temp = tempdir().unwrap();
    let cfg = test_config(temp.path());
    let services = Services::connect(cfg.clone()).await.unwrap();
    pipeline::ingest(&services, &FakeMarket { rate_limited: false }, crypto_request())
        .await
        .unwrap();
    drop(services);

    let mut switched = cfg;
    switched.embeddings.model = "BAAI/bge-small-en-v1.5".into();
    let services = Services::connect(switched).await.unwrap();

    let logs = LogCapture::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let hits = pipeline::search(&services, "BTC close", Some(2), None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(logs.contents().contains("different embedding model"));
}
