//! Terminal rendering for answers and their sources.

use finrag_core::models::{Answer, RetrievedChunk};
use regex::Regex;
use std::fmt::Write;
use std::sync::OnceLock;

const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";
const PREVIEW_CHARS: usize = 400;

fn highlight_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Dates first so they are emphasized whole rather than as three numbers.
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}|\d{1,3}(?:[,\d]*)?(?:\.\d+)?").expect("valid regex")
    })
}

/// Wraps every date and number in `open`/`close`.
pub fn emphasize(s: &str, open: &str, close: &str) -> String {
    highlight_re()
        .replace_all(s, |c: &regex::Captures| format!("{}{}{}", open, &c[0], close))
        .into_owned()
}

pub fn highlight_numbers_and_dates(s: &str) -> String {
    emphasize(s, BOLD, RESET)
}

fn preview(text: &str) -> String {
    text.chars()
        .take(PREVIEW_CHARS)
        .collect::<String>()
        .replace('\n', " ")
}

/// Numbered header with doc id, type and score, then a one-line preview.
pub fn source_line(idx: usize, ch: &RetrievedChunk, plain: bool) -> String {
    let header = format!(
        "{}. {} \u{2014} {}, score={:.4}",
        idx, ch.meta.doc_id, ch.meta.kind, ch.score
    );
    let body = preview(&ch.text);
    if plain {
        format!("{}\n   {}", header, body)
    } else {
        format!(
            "{}{}{}\n   {}",
            BOLD,
            header,
            RESET,
            highlight_numbers_and_dates(&body)
        )
    }
}

pub fn render_answer(answer: &Answer, plain: bool) -> String {
    let mut out = String::new();
    let text = if plain {
        answer.text.clone()
    } else {
        highlight_numbers_and_dates(&answer.text)
    };
    let _ = writeln!(out, "Answer:\n{}", text);
    if answer.fallback {
        let _ = writeln!(out, "(extracted from sources)");
    }
    let _ = writeln!(out, "\nSources (top chunks):");
    if answer.sources.is_empty() {
        let _ = writeln!(out, "(none)");
    }
    for (i, ch) in answer.sources.iter().enumerate() {
        let _ = writeln!(out, "{}", source_line(i + 1, ch, plain));
    }
    out
}
