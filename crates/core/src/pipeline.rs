use crate::chunker::Chunker;
use crate::config::AppConfig;
use crate::ingest::{self, IngestRequest, MarketData};
use crate::models::{Answer, Document, RetrievedChunk};
use crate::rag::{self, AnswerOptions};
use crate::retriever;
use crate::{
    indexer,
    vectorstore::{self, VectorStore},
};
use anyhow::Context;
use providers::hashing::HashingEmbedder;
use providers::noop::NoopProvider;
use providers::openai::{OpenAiConfig, OpenAiProvider};
use providers::ProviderRegistry;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use storage::{connect, migrate, StoredDocument};
use tracing::{info, warn};

/// Everything a command needs: config, database, providers and the vector store.
pub struct Services {
    pub config: AppConfig,
    pub pool: SqlitePool,
    pub registry: ProviderRegistry,
    pub store: Arc<dyn VectorStore>,
}

impl Services {
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        let registry = build_registry(&config);
        Self::connect_with_registry(config, registry).await
    }

    /// Like `connect`, with providers supplied by the caller.
    pub async fn connect_with_registry(
        config: AppConfig,
        registry: ProviderRegistry,
    ) -> anyhow::Result<Self> {
        let pool = connect(&config.database.path).await.context("db connect")?;
        migrate(&pool).await.context("db migrate")?;
        let store = vectorstore::build_vector_store(&config, &pool)?;
        Ok(Self {
            config,
            pool,
            registry,
            store,
        })
    }

    fn chunker(&self) -> Chunker {
        Chunker::from_config(&self.config.chunking)
    }
}

pub fn build_registry(config: &AppConfig) -> ProviderRegistry {
    build_registry_with_env(config, |var| std::env::var(var).ok())
}

/// Registers `hashing` and `noop` always, and `openai` when
/// `OPENAI_BASE_URL` is set (`OPENAI_API_KEY` is optional for local servers).
pub fn build_registry_with_env(
    config: &AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> ProviderRegistry {
    let mut reg = ProviderRegistry::new()
        .with_embedding(
            "hashing",
            Arc::new(HashingEmbedder::new(config.embeddings.dimensions)),
        )
        .with_embedding("noop", Arc::new(NoopProvider))
        .with_llm("noop", Arc::new(NoopProvider));

    if let Some(base) = lookup("OPENAI_BASE_URL").filter(|v| !v.is_empty()) {
        let provider = OpenAiProvider::new(OpenAiConfig {
            api_key: lookup("OPENAI_API_KEY").filter(|v| !v.is_empty()),
            base_url: base,
            embedding_model: config.embeddings.model.clone(),
            chat_model: config.generation.model.clone(),
        });
        reg = reg
            .with_embedding("openai", Arc::new(provider.clone()))
            .with_llm("openai", Arc::new(provider));
    }

    reg.set_preferred_embedding(&config.embeddings.provider)
        .set_preferred_llm(&config.generation.provider)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub documents: usize,
    pub chunks: usize,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearSummary {
    pub chunks: usize,
    pub documents: u64,
}

async fn index_documents(services: &Services, docs: &[Document]) -> anyhow::Result<usize> {
    let chunks = indexer::build_index(
        docs,
        services.chunker(),
        services.store.as_ref(),
        &services.registry,
        &services.config.embeddings,
    )
    .await?;
    if chunks > 0 {
        retriever::record_index_model(&services.pool, &services.config.embeddings).await?;
    }
    Ok(chunks)
}

/// Fetches, persists and indexes. A fetch that yields nothing leaves the
/// existing documents and index in place.
pub async fn ingest(
    services: &Services,
    source: &dyn MarketData,
    request: IngestRequest,
) -> anyhow::Result<IngestSummary> {
    let request = request.normalized();
    if request.stocks.is_empty() && request.crypto.is_empty() {
        anyhow::bail!("no symbols to ingest");
    }

    info!("Starting fetch phase...");
    let docs = ingest::build_api_docs(source, &request).await?;
    info!("Fetch complete. Built {} documents.", docs.len());
    if docs.is_empty() {
        warn!("no documents fetched; index unchanged");
        return Ok(IngestSummary::default());
    }

    let stored: Vec<StoredDocument> = docs.iter().map(StoredDocument::from).collect();
    storage::replace_documents(&services.pool, &stored).await?;

    let chunks = index_documents(services, &docs).await?;
    Ok(IngestSummary {
        documents: docs.len(),
        chunks,
        symbols: ingest::indexed_symbols(docs.iter().map(|d| d.id.as_str())),
    })
}

/// Rebuilds the index from stored documents with the current embedder and
/// chunking settings.
pub async fn reindex(services: &Services) -> anyhow::Result<IngestSummary> {
    let docs: Vec<Document> = storage::load_documents(&services.pool)
        .await?
        .into_iter()
        .map(Document::from)
        .collect();
    if docs.is_empty() {
        warn!("no stored documents; run `finrag ingest` first");
        return Ok(IngestSummary::default());
    }
    info!(documents = docs.len(), "reindexing stored documents");
    let chunks = index_documents(services, &docs).await?;
    Ok(IngestSummary {
        documents: docs.len(),
        chunks,
        symbols: ingest::indexed_symbols(docs.iter().map(|d| d.id.as_str())),
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AskOptions {
    pub k: Option<usize>,
    pub symbol: Option<String>,
    pub max_new_tokens: Option<u32>,
}

pub async fn ask(services: &Services, question: &str, opts: &AskOptions) -> anyhow::Result<Answer> {
    anyhow::ensure!(!question.trim().is_empty(), "question must not be empty");
    retriever::check_index_model(&services.pool, &services.config.embeddings).await?;
    let defaults = AnswerOptions::from_config(&services.config);
    let answer_opts = AnswerOptions {
        k: opts.k.unwrap_or(defaults.k),
        max_new_tokens: opts.max_new_tokens.unwrap_or(defaults.max_new_tokens),
        symbol: opts.symbol.clone(),
        ..defaults
    };
    rag::answer(
        question,
        &answer_opts,
        services.store.as_ref(),
        &services.registry,
        &services.config,
    )
    .await
}

pub async fn search(
    services: &Services,
    query: &str,
    k: Option<usize>,
    symbol: Option<&str>,
) -> anyhow::Result<Vec<RetrievedChunk>> {
    retriever::check_index_model(&services.pool, &services.config.embeddings).await?;
    retriever::retrieve(
        query,
        k.unwrap_or(services.config.retrieval.top_k),
        symbol,
        services.store.as_ref(),
        &services.registry,
        &services.config.embeddings,
    )
    .await
}

/// Empties the vector collection and the stored documents.
pub async fn clear(services: &Services) -> anyhow::Result<ClearSummary> {
    let chunks = services.store.clear().await?;
    let documents = storage::clear_documents(&services.pool).await?;
    info!(chunks, documents, "index cleared");
    Ok(ClearSummary { chunks, documents })
}

pub async fn symbols(services: &Services) -> anyhow::Result<Vec<String>> {
    let ids = services.store.doc_ids().await?;
    Ok(ingest::indexed_symbols(ids.iter().map(String::as_str)))
}
