use crate::config::EmbeddingConfig;
use crate::embeddings;
use crate::models::RetrievedChunk;
use crate::vectorstore::VectorStore;
use providers::ProviderRegistry;
use sqlx::SqlitePool;
use tracing::warn;

pub const META_EMBEDDING_PROVIDER: &str = "embedding_provider";
pub const META_EMBEDDING_MODEL: &str = "embedding_model";

/// Biases the query towards one ticker by prefixing it.
pub fn biased_query(query: &str, symbol: Option<&str>) -> String {
    match symbol.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sym) => format!("{} {}", sym.to_uppercase(), query),
        None => query.to_string(),
    }
}

pub async fn retrieve(
    query: &str,
    k: usize,
    symbol: Option<&str>,
    store: &dyn VectorStore,
    registry: &ProviderRegistry,
    cfg: &EmbeddingConfig,
) -> anyhow::Result<Vec<RetrievedChunk>> {
    let q = biased_query(query, symbol);
    let vector = embeddings::embed_one(&q, Some(&cfg.provider), registry).await?;
    store.query(&vector, k).await
}

/// Warns when the index was built by a different embedder than the one
/// configured now; distances across embedders are meaningless.
pub async fn check_index_model(pool: &SqlitePool, cfg: &EmbeddingConfig) -> anyhow::Result<bool> {
    let provider = storage::get_meta(pool, META_EMBEDDING_PROVIDER).await?;
    let model = storage::get_meta(pool, META_EMBEDDING_MODEL).await?;
    let (Some(provider), Some(model)) = (provider, model) else {
        return Ok(true);
    };
    if provider != cfg.provider || model != cfg.model {
        warn!(
            indexed_provider = %provider,
            indexed_model = %model,
            configured_provider = %cfg.provider,
            configured_model = %cfg.model,
            "index was built with a different embedding model; run `finrag reindex`"
        );
        return Ok(false);
    }
    Ok(true)
}

pub async fn record_index_model(pool: &SqlitePool, cfg: &EmbeddingConfig) -> anyhow::Result<()> {
    storage::set_meta(pool, META_EMBEDDING_PROVIDER, &cfg.provider).await?;
    storage::set_meta(pool, META_EMBEDDING_MODEL, &cfg.model).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_hint_prefixes_query() {
        assert_eq!(biased_query("close yesterday?", Some("btc")), "BTC close yesterday?");
        assert_eq!(biased_query("close yesterday?", Some(" ")), "close yesterday?");
        assert_eq!(biased_query("close yesterday?", None), "close yesterday?");
    }

    #[tokio::test]
    async fn model_check_flags_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let pool = storage::connect(&temp.path().join("r.db").to_string_lossy())
            .await
            .unwrap();
        storage::migrate(&pool).await.unwrap();
        let cfg = EmbeddingConfig::default();
        assert!(check_index_model(&pool, &cfg).await.unwrap());
        record_index_model(&pool, &cfg).await.unwrap();
        assert!(check_index_model(&pool, &cfg).await.unwrap());
        let other = EmbeddingConfig {
            model: "text-embedding-3-small".into(),
            ..cfg
        };
        assert!(!check_index_model(&pool, &other).await.unwrap());
    }
}
