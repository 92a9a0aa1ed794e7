//! Local feature-hashing embedder.
//!
//! Deterministic, dependency-free alternative to a hosted embedding model:
//! unigrams and adjacent bigrams are hashed into a fixed number of signed
//! buckets and the result is L2-normalized. Good enough for ticker, date and
//! field-name overlap, which is what market-data passages mostly share with
//! questions about them.

use crate::{EmbedResponse, EmbeddingProvider, ProviderError};

/// Characters kept inside a token when surrounded by alphanumerics
/// (`btc/usd`, `2024-01-05`, `187.44`, `1,234`).
const JOINERS: [char; 4] = ['.', ',', '/', '-'];
const BIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = tokenize(text);
        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, &bigram, BIGRAM_WEIGHT);
        }
        normalize(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = blake3::hash(feature.as_bytes());
        let bytes = digest.as_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(head) % self.dimensions as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        Ok(EmbedResponse {
            vectors: texts.iter().map(|t| self.embed_text(t)).collect(),
        })
    }
}

/// Lower-cased word tokens. A pair such as `btc/usd` is followed by its two
/// sides so a bare ticker still matches.
pub fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if JOINERS.contains(&c)
            && !current.is_empty()
            && chars.get(i + 1).is_some_and(|next| next.is_alphanumeric())
        {
            current.push(c);
        } else if !current.is_empty() {
            push_token(&mut tokens, std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        push_token(&mut tokens, current);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, token: String) {
    let parts: Vec<String> = if token.contains('/') {
        token.split('/').map(str::to_string).collect()
    } else {
        Vec::new()
    };
    tokens.push(token);
    tokens.extend(parts);
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
