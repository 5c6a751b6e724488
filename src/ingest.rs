//! Webhook payload parsing and signal normalization (§4.7 / §6).
//!
//! Pure functions, no I/O: `webhook.rs` owns the HTTP plumbing and calls
//! into here to turn an arbitrary request body into `(symbol, signal)`.

use std::collections::HashMap;

use crate::types::SignalKind;

/// Best-effort parse of a raw request body into a flat field map.
///
/// TradingView alerts sometimes arrive as `text/plain` even when the body is
/// valid JSON, and sometimes as genuine free text — both are accepted.
pub fn parse_body(raw: &str) -> HashMap<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return HashMap::new();
    }

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let mut fields: HashMap<String, String> = map
            .into_iter()
            .filter_map(|(k, v)| value_to_string(&v).map(|s| (k, s)))
            .collect();
        fields.entry("_raw_body".to_string()).or_insert_with(|| trimmed.to_string());
        return fields;
    }

    let mut fields = HashMap::new();
    fields.insert("content".to_string(), trimmed.to_string());
    fields.insert("_raw_body".to_string(), trimmed.to_string());
    fields
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resolve `(symbol, signal)` from a parsed field map, falling back to
/// free-text inference when explicit `symbol`/`signal` fields are absent.
pub fn resolve_symbol_and_signal(fields: &HashMap<String, String>) -> (String, Option<SignalKind>) {
    let content = fields
        .get("content")
        .or_else(|| fields.get("message"))
        .or_else(|| fields.get("alert_message"))
        .cloned()
        .unwrap_or_default();
    let content_upper = content.to_uppercase();

    let mut symbol = fields
        .get("symbol")
        .or_else(|| fields.get("ticker"))
        .cloned()
        .unwrap_or_default()
        .to_uppercase();
    if symbol.is_empty() {
        symbol = extract_symbol_from_text(&content_upper);
    }

    let explicit = fields
        .get("signal")
        .or_else(|| fields.get("action"))
        .or_else(|| fields.get("side"))
        .cloned()
        .unwrap_or_default()
        .to_uppercase();

    let signal = match explicit.as_str() {
        "BUY" | "LONG" => Some(SignalKind::Long),
        "SELL" | "SHORT" => Some(SignalKind::Short),
        "BUY_TP" => Some(SignalKind::BuyTp),
        "SELL_TP" => Some(SignalKind::SellTp),
        _ => infer_signal_from_text(&content_upper),
    };

    (symbol, signal)
}

/// Normalize a candidate symbol against the known config keys: a `.P` suffix
/// (TradingView's perpetual-contract marker) is tried both present and
/// absent before giving up and returning the input unchanged.
pub fn map_symbol_to_known(symbol: &str, known: impl Fn(&str) -> bool) -> String {
    let s = symbol.to_uppercase();
    if s.is_empty() || known(&s) {
        return s;
    }
    if let Some(base) = s.strip_suffix(".P") {
        if known(base) {
            return base.to_string();
        }
    }
    let with_suffix = format!("{}.P", s);
    if known(&with_suffix) {
        return with_suffix;
    }
    s
}

fn infer_signal_from_text(text_upper: &str) -> Option<SignalKind> {
    if text_upper.is_empty() {
        return None;
    }
    if text_upper.contains("BUY TP") || text_upper.contains("TP ALCISTA") {
        return Some(SignalKind::BuyTp);
    }
    if text_upper.contains("SELL TP") || text_upper.contains("TP BAJISTA") {
        return Some(SignalKind::SellTp);
    }
    if contains_word(text_upper, "LONG") {
        return Some(SignalKind::Long);
    }
    if contains_word(text_upper, "SHORT") {
        return Some(SignalKind::Short);
    }
    None
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.split(|c: char| !c.is_ascii_alphanumeric()).any(|tok| tok == word)
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Extract a symbol-looking token from free text: `EXCHANGE:SYMBOL`, a bare
/// `XXXUSDT[.P]`, Spanish `PARA <SYM> A`/`EN <SYM> A`, or any dotted token.
fn extract_symbol_from_text(text_upper: &str) -> String {
    let t = text_upper.trim();
    if t.is_empty() {
        return String::new();
    }

    if let Some(sym) = find_exchange_prefixed(t) {
        return sym;
    }
    if let Some(sym) = find_bare_usdt(t) {
        return sym;
    }
    if let Some(sym) = find_spanish_preposition_phrase(t) {
        return sym;
    }
    if let Some(sym) = find_dotted_token(t) {
        return sym;
    }
    String::new()
}

fn find_exchange_prefixed(t: &str) -> Option<String> {
    for token in t.split_whitespace() {
        let token = token.trim_matches(|c: char| !is_symbol_char(c) && c != ':');
        if let Some((prefix, suffix)) = token.split_once(':') {
            if !prefix.is_empty() && suffix.len() >= 3 && suffix.chars().all(is_symbol_char) {
                return Some(suffix.to_string());
            }
        }
    }
    None
}

fn find_bare_usdt(t: &str) -> Option<String> {
    for token in t.split_whitespace() {
        let token = token.trim_matches(|c: char| !is_symbol_char(c));
        let base = token.strip_suffix(".P").unwrap_or(token);
        if base.len() >= 6 && base.ends_with("USDT") && base[..base.len() - 4].chars().all(|c| c.is_ascii_alphanumeric()) {
            return Some(token.to_string());
        }
    }
    None
}

fn find_spanish_preposition_phrase(t: &str) -> Option<String> {
    let words: Vec<&str> = t.split_whitespace().collect();
    for i in 0..words.len() {
        if (words[i] == "PARA" || words[i] == "EN") && i + 2 < words.len() && words[i + 2] == "A" {
            let candidate = words[i + 1].trim_matches(|c: char| !is_symbol_char(c));
            if candidate.len() >= 3 {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

fn find_dotted_token(t: &str) -> Option<String> {
    for token in t.split_whitespace() {
        let token = token.trim_matches(|c: char| !is_symbol_char(c));
        if let Some(dot) = token.find('.') {
            let (base, ext) = (&token[..dot], &token[dot + 1..]);
            if base.len() >= 3 && !ext.is_empty() && ext.len() <= 6 && token.chars().all(is_symbol_char) {
                return Some(token.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_body_with_string_fields() {
        let fields = parse_body(r#"{"symbol": "BTCUSDT", "signal": "LONG"}"#);
        assert_eq!(fields.get("symbol").unwrap(), "BTCUSDT");
        assert_eq!(fields.get("signal").unwrap(), "LONG");
    }

    #[test]
    fn falls_back_to_content_for_plain_text() {
        let fields = parse_body("LONG signal on BTCUSDT now");
        assert_eq!(fields.get("content").unwrap(), "LONG signal on BTCUSDT now");
    }

    #[test]
    fn empty_body_parses_to_empty_map() {
        assert!(parse_body("   ").is_empty());
    }

    #[test]
    fn resolves_explicit_symbol_and_signal() {
        let mut fields = HashMap::new();
        fields.insert("symbol".to_string(), "ethusdt".to_string());
        fields.insert("action".to_string(), "buy".to_string());
        let (symbol, signal) = resolve_symbol_and_signal(&fields);
        assert_eq!(symbol, "ETHUSDT");
        assert_eq!(signal, Some(SignalKind::Long));
    }

    #[test]
    fn infers_symbol_and_signal_from_exchange_prefixed_text() {
        let mut fields = HashMap::new();
        fields.insert("content".to_string(), "BINANCE:SOLUSDT.P LONG entry".to_string());
        let (symbol, signal) = resolve_symbol_and_signal(&fields);
        assert_eq!(symbol, "SOLUSDT.P");
        assert_eq!(signal, Some(SignalKind::Long));
    }

    #[test]
    fn infers_bare_usdt_symbol_with_dot_p_suffix() {
        let mut fields = HashMap::new();
        fields.insert("content".to_string(), "Señal SOLUSDT.P SHORT ahora".to_string());
        let (symbol, signal) = resolve_symbol_and_signal(&fields);
        assert_eq!(symbol, "SOLUSDT.P");
        assert_eq!(signal, Some(SignalKind::Short));
    }

    #[test]
    fn infers_spanish_preposition_phrase() {
        let mut fields = HashMap::new();
        fields.insert("content".to_string(), "Entrada PARA BTCUSDT A mercado LONG".to_string());
        let (symbol, _signal) = resolve_symbol_and_signal(&fields);
        assert_eq!(symbol, "BTCUSDT");
    }

    #[test]
    fn infers_manual_tp_tokens() {
        let mut fields = HashMap::new();
        fields.insert("content".to_string(), "BUY TP alcanzado en BTCUSDT".to_string());
        let (_symbol, signal) = resolve_symbol_and_signal(&fields);
        assert_eq!(signal, Some(SignalKind::BuyTp));

        fields.insert("content".to_string(), "TP BAJISTA en ETHUSDT".to_string());
        let (_symbol, signal) = resolve_symbol_and_signal(&fields);
        assert_eq!(signal, Some(SignalKind::SellTp));
    }

    #[test]
    fn map_symbol_to_known_tries_dot_p_both_ways() {
        let known = |s: &str| s == "SOLUSDT";
        assert_eq!(map_symbol_to_known("SOLUSDT.P", known), "SOLUSDT");

        let known_with_suffix = |s: &str| s == "SOLUSDT.P";
        assert_eq!(map_symbol_to_known("SOLUSDT", known_with_suffix), "SOLUSDT.P");
    }
}
