//! Answer chain: retrieve, reorder, prompt, generate, and fall back to
//! extraction when the model has nothing useful to say.

use crate::config::{AppConfig, PromptStyle};
use crate::models::{Answer, RetrievedChunk};
use crate::retriever::{self, biased_query};
use crate::vectorstore::VectorStore;
use providers::{GenerationOptions, ProviderError, ProviderRegistry};
use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const SYSTEM_PROMPT: &str = "You are a concise, factual finance & crypto assistant.\n\
Answer FIRST (1-3 short sentences). On the NEXT LINE, print SOURCES in this exact format:\n\
SOURCES: [1],[2]\n\
Do NOT output only citation numbers. If the information is not present in the CONTEXT, reply exactly: \"I don't know.\"\n\
When asked for numeric values (price/volume), extract and output the numeric string exactly as present in the context.\n";

pub const UNKNOWN: &str = "I don't know.";
pub const CHUNK_MAX_CHARS: usize = 800;
const COMPANY_SNIPPET_CHARS: usize = 400;
const GENERAL_SNIPPET_CHARS: usize = 200;
const GENERAL_CONTEXT_CHUNKS: usize = 2;

const COMPANY_KEYWORDS: [&str; 8] = [
    "company",
    "overview",
    "summary",
    "profile",
    "about",
    "headquarters",
    "sector",
    "industry",
];
const NUMERIC_KEYWORDS: [&str; 6] = ["close", "open", "volume", "high", "low", "price"];

fn bracket_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\[\s*\d+\s*\]\s*(,\s*\[\s*\d+\s*\]\s*)*)\s*$").expect("valid regex")
    })
}

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?\d{1,3}(?:[,\d]*)?(?:\.\d+)?").expect("valid regex"))
}

fn close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)close\s+([0-9,]+\.?[0-9]*)").expect("valid regex"))
}

fn sentence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(.+?[.!?])\s").expect("valid regex"))
}

/// First `n` characters of `s`, on a char boundary.
fn prefix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Drops everything after the last space, if there is one.
fn cut_at_last_space(s: &str) -> &str {
    s.rsplit_once(' ').map(|(head, _)| head).unwrap_or(s)
}

pub fn shorten_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    format!("{} ...", cut_at_last_space(prefix_chars(text, max_chars)))
}

/// Numbered context blocks: `[i] {doc_id} | {type}:\n{text}`.
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, ch)| {
            format!(
                "[{}] {} | {}:\n{}",
                i + 1,
                ch.meta.doc_id,
                ch.meta.kind,
                shorten_text(&ch.text, CHUNK_MAX_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn is_company_query(query: &str) -> bool {
    let q = query.to_lowercase();
    COMPANY_KEYWORDS.iter().any(|k| q.contains(k))
}

pub fn contains_numeric_request(query: &str) -> bool {
    let q = query.to_lowercase();
    NUMERIC_KEYWORDS.iter().any(|k| q.contains(k))
}

fn is_overview(ch: &RetrievedChunk) -> bool {
    ch.meta.doc_id.to_lowercase().contains("overview")
        || ch.meta.kind.to_lowercase().contains("overview")
}

/// Overview chunks first so summaries come from them; each group closest first.
pub fn prioritize(chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    let (mut overviews, mut others): (Vec<_>, Vec<_>) = chunks.into_iter().partition(is_overview);
    let by_score = |a: &RetrievedChunk, b: &RetrievedChunk| {
        a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal)
    };
    overviews.sort_by(by_score);
    others.sort_by(by_score);
    overviews.extend(others);
    overviews
}

/// Short prompts for small instruction-tuned models.
pub fn build_prompt(query: &str, chunks: &[RetrievedChunk]) -> String {
    if let Some(best) = chunks.first() {
        if contains_numeric_request(query) {
            return format!(
                "Extract the price from this data: {}\nQuestion: {}\nAnswer:",
                best.text, query
            );
        }
        if is_company_query(query) {
            return format!(
                "Summarize this company information: {}\nQuestion: {}\nAnswer:",
                prefix_chars(&best.text, COMPANY_SNIPPET_CHARS),
                query
            );
        }
    }

    let context: String = chunks
        .iter()
        .take(GENERAL_CONTEXT_CHUNKS)
        .map(|c| format!("{}\n", prefix_chars(&c.text, GENERAL_SNIPPET_CHARS)))
        .collect();
    format!("Context: {}\n\nQuestion: {}\nAnswer:", context, query)
}

/// User message for chat models; pair with `SYSTEM_PROMPT`.
pub fn build_grounded_prompt(query: &str, chunks: &[RetrievedChunk]) -> String {
    format!("CONTEXT:\n{}\n\nQUESTION: {}", format_context(chunks), query)
}

pub fn extract_numeric(text: &str) -> Option<String> {
    numeric_re()
        .find(text)
        .map(|m| m.as_str().replace(',', ""))
}

pub fn first_sentence(text: &str) -> String {
    let text = text.trim().replace('\n', " ");
    if let Some(c) = sentence_re().captures(&text) {
        return c[1].to_string();
    }
    if text.chars().count() > GENERAL_SNIPPET_CHARS {
        format!(
            "{}...",
            cut_at_last_space(prefix_chars(&text, GENERAL_SNIPPET_CHARS))
        )
    } else {
        text
    }
}

/// Empty, trivially short, digits only, or nothing but citation markers.
pub fn is_poor_output(text: &str) -> bool {
    text.is_empty()
        || text.chars().count() <= 3
        || text.chars().all(|c| c.is_ascii_digit())
        || bracket_only_re().is_match(text)
}

/// Deterministic answer drawn from the best chunk.
pub fn fallback_answer(query: &str, chunks: &[RetrievedChunk]) -> String {
    let Some(best) = chunks.first() else {
        return UNKNOWN.to_string();
    };
    if contains_numeric_request(query) {
        if let Some(c) = close_re().captures(&best.text) {
            return match best.meta.symbol() {
                Some(sym) => format!("{} close price: {}", sym, &c[1]),
                None => format!("Close price: {}", &c[1]),
            };
        }
        if let Some(num) = extract_numeric(&best.text) {
            return format!("Price: {}", num);
        }
    }
    first_sentence(&best.text)
}

#[derive(Debug, Clone)]
pub struct AnswerOptions {
    pub k: usize,
    pub prompt_chunks: usize,
    pub max_new_tokens: u32,
    pub symbol: Option<String>,
}

impl AnswerOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            k: cfg.retrieval.answer_k,
            prompt_chunks: cfg.retrieval.prompt_chunks,
            max_new_tokens: cfg.generation.max_new_tokens,
            symbol: None,
        }
    }
}

async fn generate(
    prompt: &str,
    opts: &GenerationOptions,
    registry: &ProviderRegistry,
    provider: &str,
) -> String {
    let llm = match registry.llm(Some(provider)) {
        Ok(llm) => llm,
        Err(e) => {
            warn!(error = %e, "no generation provider, answering from context");
            return String::new();
        }
    };
    match llm.generate(prompt, opts).await {
        Ok(text) => text,
        Err(ProviderError::NotImplemented) => {
            debug!(provider, "provider does not generate, answering from context");
            String::new()
        }
        Err(e) => {
            warn!(error = %e, provider, "generation failed, answering from context");
            String::new()
        }
    }
}

pub async fn answer(
    query: &str,
    opts: &AnswerOptions,
    store: &dyn VectorStore,
    registry: &ProviderRegistry,
    cfg: &AppConfig,
) -> anyhow::Result<Answer> {
    let candidates = retriever::retrieve(
        query,
        opts.k,
        opts.symbol.as_deref(),
        store,
        registry,
        &cfg.embeddings,
    )
    .await?;
    let mut chunks = prioritize(candidates);
    chunks.truncate(opts.prompt_chunks);

    let question = biased_query(query, opts.symbol.as_deref());
    let (prompt, gen_opts) = match cfg.generation.prompt_style {
        PromptStyle::Compact => (
            build_prompt(&question, &chunks),
            GenerationOptions {
                max_new_tokens: opts.max_new_tokens,
                system: None,
            },
        ),
        PromptStyle::Grounded => (
            build_grounded_prompt(&question, &chunks),
            GenerationOptions {
                max_new_tokens: opts.max_new_tokens,
                system: Some(SYSTEM_PROMPT.to_string()),
            },
        ),
    };
    debug!(chunks = chunks.len(), prompt_len = prompt.len(), "prompt built");

    let generated = generate(&prompt, &gen_opts, registry, &cfg.generation.provider).await;
    let text = generated.trim();
    if is_poor_output(text) {
        return Ok(Answer {
            text: fallback_answer(&question, &chunks),
            sources: chunks,
            fallback: true,
        });
    }
    Ok(Answer {
        text: text.to_string(),
        sources: chunks,
        fallback: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMeta;

    fn chunk(doc_id: &str, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            id: format!("{}#chunk0", doc_id),
            text: text.to_string(),
            meta: ChunkMeta {
                source: "alpha_vantage".into(),
                chunk: 0,
                doc_id: doc_id.into(),
                kind: "api/alpha_vantage".into(),
            },
            score,
        }
    }

    #[test]
    fn overviews_come_first_then_by_distance() {
        let ordered = prioritize(vec![
            chunk("av/AAPL/daily#1", "b", 0.2),
            chunk("av/AAPL/overview", "o", 0.9),
            chunk("av/AAPL/daily#0", "a", 0.1),
        ]);
        let ids: Vec<&str> = ordered.iter().map(|c| c.meta.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["av/AAPL/overview", "av/AAPL/daily#0", "av/AAPL/daily#1"]);
    }

    #[test]
    fn prompt_shape_follows_query_kind() {
        let chunks = vec![
            chunk("av/BTC-USD/digital_daily#0", "BTC/USD on 2024-01-05: close 44145.1", 0.1),
            chunk("av/AAPL/overview", &"Apple ".repeat(100), 0.2),
        ];
        let numeric = build_prompt("What was BTC close?", &chunks);
        assert!(numeric.starts_with("Extract the price from this data: BTC/USD on 2024-01-05"));
        assert!(numeric.ends_with("Question: What was BTC close?\nAnswer:"));

        let company = build_prompt("Company summary for Apple", &chunks[1..]);
        let body = company
            .strip_prefix("Summarize this company information: ")
            .unwrap();
        assert_eq!(body.split('\n').next().unwrap().chars().count(), 400);

        let general = build_prompt("Who is the CEO?", &chunks);
        assert!(general.starts_with("Context: BTC/USD on 2024-01-05: close 44145.1\n"));
        assert!(general.ends_with("\n\nQuestion: Who is the CEO?\nAnswer:"));
    }

    #[test]
    fn general_prompt_without_chunks() {
        assert_eq!(
            build_prompt("What is up?", &[]),
            "Context: \n\nQuestion: What is up?\nAnswer:"
        );
    }

    #[test]
    fn grounded_context_numbers_and_shortens() {
        let chunks = vec![chunk("av/AAPL/overview", &"word ".repeat(300), 0.1)];
        let ctx = format_context(&chunks);
        assert!(ctx.starts_with("[1] av/AAPL/overview | api/alpha_vantage:\n"));
        assert!(ctx.ends_with(" ..."));
        assert!(build_grounded_prompt("q", &chunks).ends_with("\n\nQUESTION: q"));
    }

    #[test]
    fn poor_outputs_are_detected() {
        assert!(is_poor_output(""));
        assert!(is_poor_output("ok"));
        assert!(is_poor_output("44145"));
        assert!(is_poor_output("[1], [2]"));
        assert!(!is_poor_output("BTC closed at 44145.1 [1]"));
    }

    #[test]
    fn numeric_fallback_uses_close_with_symbol() {
        let chunks = vec![chunk(
            "av/ETH-USD/digital_daily#0",
            "ETH/USD on 2024-01-05: open 2,268.1, high 2,277.0, low 2,207.9, close 2,269.9, volume 300.",
            0.1,
        )];
        assert_eq!(
            fallback_answer("ETH close price?", &chunks),
            "ETH close price: 2,269.9"
        );
    }

    #[test]
    fn numeric_fallback_without_close_takes_first_number() {
        let chunks = vec![chunk("av/news#0", "Volume hit 1,234,567.5 shares today.", 0.1)];
        assert_eq!(fallback_answer("what volume?", &chunks), "Price: 1234567.5");
    }

    #[test]
    fn other_fallbacks() {
        let chunks = vec![chunk(
            "av/AAPL/overview",
            "AAPL Company Overview:\n- Name: Apple Inc. Designs phones.",
            0.1,
        )];
        assert_eq!(
            fallback_answer("Tell me about Apple", &chunks),
            "AAPL Company Overview: - Name: Apple Inc."
        );
        assert_eq!(fallback_answer("anything", &[]), UNKNOWN);
    }

    #[test]
    fn first_sentence_truncates_long_text_without_terminator() {
        let long = "word ".repeat(60);
        let out = first_sentence(&long);
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= 203);
        assert_eq!(first_sentence("no terminator here"), "no terminator here");
    }

    #[test]
    fn shorten_text_respects_limit() {
        assert_eq!(shorten_text("short", 10), "short");
        assert_eq!(shorten_text("alpha beta gamma", 12), "alpha beta ...");
    }
}
