//! Fetches market data and serializes JSON payloads into short passages.

use crate::models::{symbol_from_doc_id, Document, DEFAULT_KIND};
use providers::alphavantage::AvClient;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

const NEWS_LIMIT: usize = 40;
const MISSING: &str = "n/a";

/// Upstream market data, one JSON payload per call.
#[async_trait::async_trait]
pub trait MarketData: Send + Sync {
    async fn overview(&self, symbol: &str) -> anyhow::Result<Value>;
    async fn daily_adjusted(&self, symbol: &str, outputsize: &str) -> anyhow::Result<Value>;
    async fn earnings(&self, symbol: &str) -> anyhow::Result<Value>;
    async fn crypto_daily(&self, symbol: &str, market: &str) -> anyhow::Result<Value>;
    async fn news(&self, tickers_csv: &str, limit: u32) -> anyhow::Result<Value>;
}

#[async_trait::async_trait]
impl MarketData for AvClient {
    async fn overview(&self, symbol: &str) -> anyhow::Result<Value> {
        Ok(AvClient::overview(self, symbol).await?)
    }

    async fn daily_adjusted(&self, symbol: &str, outputsize: &str) -> anyhow::Result<Value> {
        Ok(AvClient::daily_adjusted(self, symbol, outputsize).await?)
    }

    async fn earnings(&self, symbol: &str) -> anyhow::Result<Value> {
        Ok(AvClient::earnings(self, symbol).await?)
    }

    async fn crypto_daily(&self, symbol: &str, market: &str) -> anyhow::Result<Value> {
        Ok(AvClient::crypto_daily(self, symbol, market).await?)
    }

    async fn news(&self, tickers_csv: &str, limit: u32) -> anyhow::Result<Value> {
        Ok(AvClient::news(self, tickers_csv, limit).await?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestRequest {
    pub stocks: Vec<String>,
    pub crypto: Vec<String>,
    pub market: String,
    pub days: usize,
    pub include_overview: bool,
    pub include_earnings: bool,
    pub include_news: bool,
}

impl Default for IngestRequest {
    fn default() -> Self {
        Self {
            stocks: Vec::new(),
            crypto: Vec::new(),
            market: "USD".to_string(),
            days: 365,
            include_overview: true,
            include_earnings: true,
            include_news: false,
        }
    }
}

impl IngestRequest {
    /// Upper-cases symbols and the market and drops blanks.
    pub fn normalized(mut self) -> Self {
        self.stocks = normalize_symbols(&self.stocks);
        self.crypto = normalize_symbols(&self.crypto);
        self.market = self.market.trim().to_uppercase();
        if self.market.is_empty() {
            self.market = "USD".to_string();
        }
        self
    }
}

/// `"aapl, msft,,"` -> `["AAPL", "MSFT"]`.
pub fn parse_symbols(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    symbols
        .iter()
        .flat_map(|s| parse_symbols(s))
        .collect()
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(MISSING.to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// First present, non-empty value among `keys`.
fn first_field(row: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| row.get(*k).and_then(scalar_text))
        .find(|s| !s.is_empty() && s != MISSING)
}

fn or_missing(v: Option<String>) -> String {
    v.unwrap_or_else(|| MISSING.to_string())
}

/// `"{title}:"` followed by `- key: value` for every scalar entry.
pub fn kv_to_text(title: &str, kv: &Value) -> String {
    let mut lines = vec![format!("{}:", title)];
    if let Some(obj) = kv.as_object() {
        for (k, v) in obj {
            if let Some(text) = scalar_text(v) {
                lines.push(format!("- {}: {}", k, text));
            }
        }
    }
    lines.join("\n")
}

fn find_series<'a>(
    json: &'a Value,
    matches: impl Fn(&str) -> bool,
) -> Option<&'a Map<String, Value>> {
    json.as_object()?
        .iter()
        .find(|(k, _)| matches(k))
        .and_then(|(_, v)| v.as_object())
}

/// Most recent `max_days` rows, newest first.
fn recent_rows(
    series: &Map<String, Value>,
    max_days: usize,
) -> Vec<(&str, &Map<String, Value>)> {
    let mut rows: Vec<(&str, &Map<String, Value>)> = series
        .iter()
        .filter_map(|(date, row)| row.as_object().map(|r| (date.as_str(), r)))
        .collect();
    rows.sort_by(|a, b| b.0.cmp(a.0));
    rows.truncate(max_days);
    rows
}

pub fn stock_passages(symbol: &str, ts_json: &Value, max_days: usize) -> Vec<String> {
    let Some(series) = find_series(ts_json, |k| k.contains("Time Series")) else {
        return Vec::new();
    };
    recent_rows(series, max_days)
        .into_iter()
        .map(|(date, row)| {
            let o = or_missing(first_field(row, &["1. open"]));
            let h = or_missing(first_field(row, &["2. high"]));
            let l = or_missing(first_field(row, &["3. low"]));
            let c = or_missing(first_field(row, &["4. close", "5. adjusted close"]));
            let v = or_missing(first_field(row, &["6. volume", "5. volume", "volume"]));
            format!(
                "{} daily bar on {}: open {}, high {}, low {}, close {}, volume {}.",
                symbol, date, o, h, l, c, v
            )
        })
        .collect()
}

/// Key patterns for one crypto price field such as `open` or `close`,
/// compiled once per series.
///
/// Tries keys like `1a. open (USD)` for the requested market, then the same
/// pattern for any currency, then any key containing the field name.
pub struct CryptoField {
    base: String,
    exact: Option<Regex>,
    any_currency: Option<Regex>,
}

impl CryptoField {
    pub fn new(field_base: &str, market: &str) -> Self {
        let exact = Regex::new(&format!(
            r"(?i)\b\d+[ab]\.\s*{}\s*\(\s*{}\s*\)",
            regex::escape(field_base),
            regex::escape(market)
        ))
        .ok();
        let any_currency = Regex::new(&format!(
            r"(?i)\b\d+[ab]\.\s*{}\s*\(\s*[A-Z]{{3,}}\s*\)",
            regex::escape(field_base)
        ))
        .ok();
        Self {
            base: field_base.to_lowercase(),
            exact,
            any_currency,
        }
    }

    pub fn pick(&self, row: &Map<String, Value>) -> Option<String> {
        for pattern in [&self.exact, &self.any_currency].into_iter().flatten() {
            if let Some(v) = row
                .iter()
                .find(|(k, _)| pattern.is_match(k))
                .and_then(|(_, v)| scalar_text(v))
            {
                return Some(v);
            }
        }
        row.iter()
            .find(|(k, _)| k.to_lowercase().contains(&self.base))
            .and_then(|(_, v)| scalar_text(v))
    }
}

pub fn crypto_passages(symbol: &str, market: &str, json: &Value, max_days: usize) -> Vec<String> {
    let Some(series) = find_series(json, |k| k.to_lowercase().contains("time series")) else {
        return Vec::new();
    };
    let [open, high, low, close] =
        ["open", "high", "low", "close"].map(|base| CryptoField::new(base, market));
    recent_rows(series, max_days)
        .into_iter()
        .map(|(date, row)| {
            let price = |plain: &str, field: &CryptoField| {
                or_missing(first_field(row, &[plain]).or_else(|| field.pick(row)))
            };
            let o = price("1. open", &open);
            let h = price("2. high", &high);
            let l = price("3. low", &low);
            let c = price("4. close", &close);
            let v = or_missing(first_field(row, &["5. volume", "6. market cap (usd)"]));
            format!(
                "{}/{} on {}: open {}, high {}, low {}, close {}, volume {}.",
                symbol, market, date, o, h, l, c, v
            )
        })
        .collect()
}

fn format_published(raw: &str) -> String {
    chrono::NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S")
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

pub fn news_passages(news_json: &Value) -> Vec<String> {
    let Some(feed) = news_json.get("feed").and_then(Value::as_array) else {
        return Vec::new();
    };
    feed.iter()
        .take(NEWS_LIMIT)
        .map(|item| {
            let field = |k: &str| or_missing(item.get(k).and_then(scalar_text));
            let ts = item
                .get("time_published")
                .and_then(Value::as_str)
                .map(format_published)
                .unwrap_or_default();
            format!(
                "News on {}: {} \u{2014} {} [sentiment: {}] Source: {}. URL: {}",
                ts,
                field("title"),
                field("summary"),
                field("overall_sentiment_label"),
                field("source"),
                field("url")
            )
        })
        .collect()
}

fn doc(id: String, text: String, source: &str) -> Document {
    Document {
        id,
        text,
        source: source.to_string(),
        kind: DEFAULT_KIND.to_string(),
    }
}

/// Fetches every requested payload and returns passages ready for indexing.
pub async fn build_api_docs(
    source: &dyn MarketData,
    req: &IngestRequest,
) -> anyhow::Result<Vec<Document>> {
    let mut docs = Vec::new();

    for sym in &req.stocks {
        info!(symbol = %sym, "fetching stock data");
        if req.include_overview {
            let ov = source.overview(sym).await?;
            docs.push(doc(
                format!("av/{}/overview", sym),
                kv_to_text(&format!("{} Company Overview", sym), &ov),
                "alpha_vantage:overview",
            ));
        }
        let outputsize = if req.days > 100 { "full" } else { "compact" };
        let ts = source.daily_adjusted(sym, outputsize).await?;
        for (i, passage) in stock_passages(sym, &ts, req.days).into_iter().enumerate() {
            docs.push(doc(
                format!("av/{}/daily#{}", sym, i),
                passage,
                "alpha_vantage:time_series_daily_adjusted",
            ));
        }
        if req.include_earnings {
            let er = source.earnings(sym).await?;
            docs.push(doc(
                format!("av/{}/earnings", sym),
                kv_to_text(&format!("{} Earnings (AV)", sym), &er),
                "alpha_vantage:earnings",
            ));
        }
    }

    for sym in &req.crypto {
        info!(symbol = %sym, market = %req.market, "fetching crypto data");
        let json = source.crypto_daily(sym, &req.market).await?;
        for (i, passage) in crypto_passages(sym, &req.market, &json, req.days)
            .into_iter()
            .enumerate()
        {
            docs.push(doc(
                format!("av/{}-{}/digital_daily#{}", sym, req.market, i),
                passage,
                "alpha_vantage:digital_currency_daily",
            ));
        }
    }

    // NEWS_SENTIMENT is equity-ticker oriented, so crypto alone fetches nothing.
    if req.include_news && !req.stocks.is_empty() {
        let universe = req.stocks.join(",");
        info!(tickers = %universe, "fetching news sentiment");
        let news = source.news(&universe, NEWS_LIMIT as u32).await?;
        for (j, passage) in news_passages(&news).into_iter().enumerate() {
            docs.push(doc(
                format!("av/news#{}", j),
                passage,
                "alpha_vantage:news_sentiment",
            ));
        }
    }

    debug!(count = docs.len(), "built api documents");
    Ok(docs)
}

/// Symbols represented in a document set, in first-seen order.
pub fn indexed_symbols<'a>(doc_ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in doc_ids {
        if let Some(sym) = symbol_from_doc_id(id) {
            if !out.contains(&sym) {
                out.push(sym);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves canned payloads and records every news request.
    #[derive(Default)]
    struct Recorder {
        news_calls: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait::async_trait]
    impl MarketData for Recorder {
        async fn overview(&self, symbol: &str) -> anyhow::Result<Value> {
            Ok(json!({ "Symbol": symbol }))
        }

        async fn daily_adjusted(&self, _symbol: &str, _outputsize: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }

        async fn earnings(&self, symbol: &str) -> anyhow::Result<Value> {
            Ok(json!({ "symbol": symbol }))
        }

        async fn crypto_daily(&self, _symbol: &str, _market: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }

        async fn news(&self, tickers_csv: &str, limit: u32) -> anyhow::Result<Value> {
            self.news_calls
                .lock()
                .unwrap()
                .push((tickers_csv.to_string(), limit));
            Ok(json!({"feed": [
                {"time_published": "20240105T133000", "title": "Apple rallies",
                 "summary": "Up.", "overall_sentiment_label": "Bullish",
                 "source": "Wire", "url": "https://example.com/a"},
                {"time_published": "20240105T140000", "title": "Microsoft dips",
                 "summary": "Down.", "overall_sentiment_label": "Bearish",
                 "source": "Wire", "url": "https://example.com/b"}
            ]}))
        }
    }

    #[tokio::test]
    async fn news_covers_all_stock_tickers_in_one_request() {
        let source = Recorder::default();
        let req = IngestRequest {
            stocks: vec!["AAPL".into(), "MSFT".into()],
            crypto: vec!["BTC".into()],
            include_overview: false,
            include_earnings: false,
            include_news: true,
            ..IngestRequest::default()
        };
        let docs = build_api_docs(&source, &req).await.unwrap();

        assert_eq!(
            *source.news_calls.lock().unwrap(),
            vec![("AAPL,MSFT".to_string(), NEWS_LIMIT as u32)]
        );
        let news: Vec<&Document> = docs.iter().filter(|d| d.id.starts_with("av/news#")).collect();
        assert_eq!(news.len(), 2);
        assert_eq!(news[0].id, "av/news#0");
        assert_eq!(news[1].id, "av/news#1");
        assert!(news.iter().all(|d| d.source == "alpha_vantage:news_sentiment"));
        assert!(news[1].text.contains("Microsoft dips"));
    }

    #[tokio::test]
    async fn crypto_only_or_news_disabled_skips_news() {
        let source = Recorder::default();
        let crypto_only = IngestRequest {
            crypto: vec!["BTC".into()],
            include_news: true,
            ..IngestRequest::default()
        };
        let docs = build_api_docs(&source, &crypto_only).await.unwrap();
        assert!(docs.is_empty());

        let stocks_without_news = IngestRequest {
            stocks: vec!["AAPL".into()],
            ..IngestRequest::default()
        };
        let docs = build_api_docs(&source, &stocks_without_news).await.unwrap();
        assert_eq!(
            docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["av/AAPL/overview", "av/AAPL/earnings"]
        );
        assert!(source.news_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn kv_to_text_skips_nested_values_and_keeps_order() {
        let ov = json!({
            "Symbol": "AAPL",
            "Name": "Apple Inc",
            "MarketCapitalization": 3000000000000u64,
            "annualEarnings": [{"fiscalDateEnding": "2023-09-30"}],
            "Sector": "TECHNOLOGY"
        });
        assert_eq!(
            kv_to_text("AAPL Company Overview", &ov),
            "AAPL Company Overview:\n- Symbol: AAPL\n- Name: Apple Inc\n- MarketCapitalization: 3000000000000\n- Sector: TECHNOLOGY"
        );
    }

    #[test]
    fn stock_passages_are_newest_first_and_capped() {
        let ts = json!({
            "Meta Data": {"2. Symbol": "AAPL"},
            "Time Series (Daily)": {
                "2024-01-03": {"1. open": "184.2", "2. high": "185.9", "3. low": "183.4", "4. close": "184.25", "6. volume": "58414460"},
                "2024-01-05": {"1. open": "181.99", "2. high": "182.76", "3. low": "180.17", "5. adjusted close": "181.18", "6. volume": "62303300"},
                "2024-01-04": {"1. open": "182.15", "2. high": "183.09", "3. low": "180.88", "4. close": "181.91", "5. volume": "71983600"}
            }
        });
        let passages = stock_passages("AAPL", &ts, 2);
        assert_eq!(
            passages,
            vec![
                "AAPL daily bar on 2024-01-05: open 181.99, high 182.76, low 180.17, close 181.18, volume 62303300.",
                "AAPL daily bar on 2024-01-04: open 182.15, high 183.09, low 180.88, close 181.91, volume 71983600.",
            ]
        );
    }

    #[test]
    fn missing_series_yields_nothing() {
        assert!(stock_passages("AAPL", &json!({"Information": "premium"}), 5).is_empty());
        assert!(crypto_passages("BTC", "USD", &json!({}), 5).is_empty());
    }

    #[test]
    fn crypto_plain_keys() {
        let js = json!({
            "Time Series (Digital Currency Daily)": {
                "2024-01-05": {"1. open": "44151.1", "2. high": "44357.4", "3. low": "42450.0", "4. close": "44145.1", "5. volume": "1392.9"}
            }
        });
        assert_eq!(
            crypto_passages("BTC", "USD", &js, 10),
            vec!["BTC/USD on 2024-01-05: open 44151.1, high 44357.4, low 42450.0, close 44145.1, volume 1392.9."]
        );
    }

    #[test]
    fn crypto_market_suffixed_keys_fall_back_by_currency() {
        let js = json!({
            "time series (digital currency daily)": {
                "2023-06-01": {
                    "1a. open (EUR)": "24800.0",
                    "1b. open (USD)": "27210.3",
                    "2a. high (USD)": "27350.0",
                    "3a. low (EUR)": "24100.0",
                    "4b. close (USD)": "26820.1",
                    "6. market cap (usd)": "910000"
                }
            }
        });
        let passages = crypto_passages("BTC", "USD", &js, 1);
        assert_eq!(
            passages,
            vec!["BTC/USD on 2023-06-01: open 27210.3, high 27350.0, low 24100.0, close 26820.1, volume 910000."]
        );
    }

    #[test]
    fn crypto_field_last_ditch_substring() {
        let close = CryptoField::new("close", "USD");
        let row = json!({"closing price": "10"});
        assert_eq!(close.pick(row.as_object().unwrap()), None);
        let row = json!({"close usd": "10"});
        assert_eq!(close.pick(row.as_object().unwrap()).as_deref(), Some("10"));
    }

    #[test]
    fn crypto_field_is_reused_across_rows() {
        let open = CryptoField::new("open", "EUR");
        let rows = [
            json!({"1a. open (EUR)": "24800.0", "1b. open (USD)": "27210.3"}),
            json!({"1b. open (USD)": "27000.0"}),
            json!({"volume": "5"}),
        ];
        let picked: Vec<Option<String>> = rows
            .iter()
            .map(|r| open.pick(r.as_object().unwrap()))
            .collect();
        assert_eq!(
            picked,
            vec![Some("24800.0".to_string()), Some("27000.0".to_string()), None]
        );
    }

    #[test]
    fn news_passage_formats_timestamp() {
        let news = json!({"feed": [
            {"time_published": "20240105T133000", "title": "Apple rallies", "summary": "Shares up.",
             "overall_sentiment_label": "Bullish", "source": "Wire", "url": "https://example.com/a"},
            {"time_published": "garbled", "title": "T", "summary": "S",
             "overall_sentiment_label": "Neutral", "source": "W", "url": "u"}
        ]});
        let passages = news_passages(&news);
        assert_eq!(
            passages[0],
            "News on 2024-01-05 13:30:00: Apple rallies \u{2014} Shares up. [sentiment: Bullish] Source: Wire. URL: https://example.com/a"
        );
        assert!(passages[1].starts_with("News on garbled: T"));
    }

    #[test]
    fn symbols_are_parsed_and_deduplicated() {
        assert_eq!(parse_symbols(" aapl, msft ,,"), vec!["AAPL", "MSFT"]);
        let ids = [
            "av/AAPL/overview",
            "av/AAPL/daily#0",
            "av/BTC-USD/digital_daily#0",
            "av/news#0",
        ];
        assert_eq!(indexed_symbols(ids), vec!["AAPL", "BTC"]);
    }
}
