use anyhow::ensure;
use providers::ProviderRegistry;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub texts: Vec<String>,
    pub provider: Option<String>,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub vectors: Vec<Vec<f32>>,
}

/// Embeds texts in batches; every vector comes back L2-normalized.
pub async fn embed(
    req: EmbeddingRequest,
    registry: &ProviderRegistry,
) -> anyhow::Result<EmbeddingResult> {
    let provider = registry.embedding(req.provider.as_deref())?;
    let mut vectors = Vec::with_capacity(req.texts.len());
    for (i, batch) in req.texts.chunks(req.batch_size.max(1)).enumerate() {
        debug!(batch = i, size = batch.len(), "embedding batch");
        let resp = provider.embed(batch).await?;
        ensure!(
            resp.vectors.len() == batch.len(),
            "embedding provider returned {} vectors for {} texts",
            resp.vectors.len(),
            batch.len()
        );
        vectors.extend(resp.vectors.into_iter().map(normalized));
    }
    Ok(EmbeddingResult { vectors })
}

pub async fn embed_one(
    text: &str,
    provider: Option<&str>,
    registry: &ProviderRegistry,
) -> anyhow::Result<Vec<f32>> {
    let result = embed(
        EmbeddingRequest {
            texts: vec![text.to_string()],
            provider: provider.map(str::to_string),
            batch_size: 1,
        },
        registry,
    )
    .await?;
    Ok(result.vectors.into_iter().next().unwrap_or_default())
}

pub fn normalized(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}
