//! Typed operations against the perpetual-futures exchange (§4.2), built on
//! top of Bitunix's signed-REST wire protocol (§6).
//!
//! Read-only and idempotent calls go through [`with_retry`]; calls that
//! place or close an order are never auto-retried here — a retried market
//! order is not idempotent, so retrying it would risk a duplicate fill. The
//! executor's own self-healing (`ensure_position_sl`, `cancel_conditional`)
//! is implemented as an explicit two-step fallback instead.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde_json::json;

use crate::error::{classify_error, GatewayError};
use crate::signing::{canonical_body, query_string_for_sign, random_nonce, sign_request};
use crate::types::{ExchangePosition, OrderDetail, OrderStatus, PendingConditional, Side, SymbolInfo};

const BASE_URL: &str = "https://fapi.bitunix.com";

async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut retries = 0;
    let mut delay: u64 = 1;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(GatewayError::RateLimit { retry_after }) => {
                if retries >= max_retries {
                    return Err(GatewayError::RateLimit { retry_after });
                }
                log::warn!("rate limited — sleeping {}s (attempt {}/{})", retry_after, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                retries += 1;
            }
            Err(GatewayError::Transient(msg)) => {
                if retries >= max_retries {
                    return Err(GatewayError::Transient(msg));
                }
                log::warn!("transient error: {} — retry in {}s ({}/{})", msg, delay, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(60);
                retries += 1;
            }
            Err(e @ GatewayError::Permanent(_)) => return Err(e),
        }
    }
}

#[derive(Clone)]
pub struct BitunixClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BitunixClient {
    pub fn new(api_key: String, api_secret: String) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("HTTP client build failed");

        BitunixClient { client, base_url: BASE_URL.to_string(), api_key, api_secret }
    }

    fn timestamp_ms() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis()
            .to_string()
    }

    /// Issue a signed GET with `query` params, returning the `data` field of
    /// a successful envelope.
    async fn signed_get(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value, GatewayError> {
        let nonce = random_nonce();
        let ts = Self::timestamp_ms();
        let qs = query_string_for_sign(query);
        let sign = sign_request(&nonce, &ts, &self.api_key, &qs, "", &self.api_secret);

        let mut req = self.client.get(format!("{}{}", self.base_url, path));
        for (k, v) in query {
            req = req.query(&[(k, v)]);
        }
        let resp = req
            .header("api-key", &self.api_key)
            .header("nonce", &nonce)
            .header("timestamp", &ts)
            .header("sign", &sign)
            .header("language", "en-US")
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("HTTP error: {}", e)))?;

        self.decode_envelope(resp).await
    }

    /// Issue a signed POST with a JSON `body`, returning the `data` field of
    /// a successful envelope.
    async fn signed_post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, GatewayError> {
        let nonce = random_nonce();
        let ts = Self::timestamp_ms();
        let body_str = canonical_body(body);
        let sign = sign_request(&nonce, &ts, &self.api_key, "", &body_str, &self.api_secret);

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("api-key", &self.api_key)
            .header("nonce", &nonce)
            .header("timestamp", &ts)
            .header("sign", &sign)
            .header("language", "en-US")
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("HTTP error: {}", e)))?;

        self.decode_envelope(resp).await
    }

    async fn decode_envelope(&self, resp: reqwest::Response) -> Result<serde_json::Value, GatewayError> {
        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("parse error: {}", e)))?;

        let code = json["code"].as_i64().unwrap_or(-1);
        if code == 0 {
            Ok(json["data"].clone())
        } else {
            let msg = json["msg"].as_str().unwrap_or("unknown");
            Err(classify_error(code, http_status, msg))
        }
    }

    // ── Read-only / idempotent operations (retried) ─────────────────────

    pub async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, GatewayError> {
        let sym = symbol.to_string();
        with_retry(
            || {
                let sym = sym.clone();
                async move {
                    let data = self.signed_get("/api/v1/futures/market/symbols", &[("symbol", sym)]).await?;
                    let entry = data.as_array().and_then(|a| a.first()).cloned().unwrap_or(serde_json::Value::Null);
                    let base_precision = entry["basePrecision"].as_u64().unwrap_or(3) as u32;
                    let quote_precision = entry["quotePrecision"].as_u64().unwrap_or(2) as u32;
                    let min_trade_volume = entry["minTradeVolume"]
                        .as_str()
                        .and_then(|s| s.parse::<Decimal>().ok())
                        .unwrap_or(Decimal::new(1, 3));
                    Ok(SymbolInfo { base_precision, quote_precision, min_trade_volume })
                }
            },
            3,
        )
        .await
    }

    pub async fn get_last_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let sym = symbol.to_string();
        with_retry(
            || {
                let sym = sym.clone();
                async move {
                    let data = self.signed_get("/api/v1/futures/market/ticker", &[("symbol", sym)]).await?;
                    let entry = data.as_array().and_then(|a| a.first()).cloned().unwrap_or(data);
                    let price = entry["lastPrice"]
                        .as_str()
                        .and_then(|s| s.parse::<Decimal>().ok())
                        .ok_or_else(|| GatewayError::Transient("missing lastPrice".into()))?;
                    if price <= Decimal::ZERO {
                        return Err(GatewayError::Transient("non-positive lastPrice".into()));
                    }
                    Ok(price)
                }
            },
            3,
        )
        .await
    }

    pub async fn get_account_available(&self, margin_coin: &str) -> Result<Decimal, GatewayError> {
        let coin = margin_coin.to_string();
        with_retry(
            || {
                let coin = coin.clone();
                async move {
                    let data = self.signed_get("/api/v1/futures/account", &[("marginCoin", coin)]).await?;
                    data["available"]
                        .as_str()
                        .and_then(|s| s.parse::<Decimal>().ok())
                        .ok_or_else(|| GatewayError::Transient("missing available balance".into()))
                }
            },
            3,
        )
        .await
    }

    pub async fn get_pending_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, GatewayError> {
        let sym = symbol.map(|s| s.to_string());
        with_retry(
            || {
                let sym = sym.clone();
                async move {
                    let mut query = Vec::new();
                    if let Some(s) = &sym {
                        query.push(("symbol", s.clone()));
                    }
                    let data = self.signed_get("/api/v1/futures/position/get_pending_positions", &query).await?;
                    let list = data.as_array().cloned().unwrap_or_default();
                    Ok(list.iter().filter_map(parse_exchange_position).collect())
                }
            },
            3,
        )
        .await
    }

    pub async fn get_pending_conditionals(&self, symbol: Option<&str>, limit: u32) -> Result<Vec<PendingConditional>, GatewayError> {
        let sym = symbol.map(|s| s.to_string());
        with_retry(
            || {
                let sym = sym.clone();
                async move {
                    let mut query = vec![("limit", limit.to_string())];
                    if let Some(s) = &sym {
                        query.push(("symbol", s.clone()));
                    }
                    let data = self.signed_get("/api/v1/futures/tpsl/get_pending_orders", &query).await?;
                    let list = data.as_array().cloned().unwrap_or_default();
                    Ok(list.iter().filter_map(parse_pending_conditional).collect())
                }
            },
            3,
        )
        .await
    }

    pub async fn get_order_detail(&self, order_id: &str) -> Result<OrderDetail, GatewayError> {
        let oid = order_id.to_string();
        with_retry(
            || {
                let oid = oid.clone();
                async move {
                    let data = self.signed_get("/api/v1/futures/order/detail", &[("orderId", oid)]).await?;
                    Ok(parse_order_detail(&data))
                }
            },
            3,
        )
        .await
    }

    // ── Best-effort mutations (failures logged, never surfaced) ─────────

    pub async fn set_margin_mode(&self, symbol: &str, margin_coin: &str, mode: &str) {
        let body = json!({ "symbol": symbol, "marginCoin": margin_coin, "marginMode": mode });
        if let Err(e) = self.signed_post("/api/v1/futures/account/change_margin_mode", &body).await {
            log::warn!("[{}] set_margin_mode failed (best-effort, ignored): {}", symbol, e);
        }
    }

    pub async fn set_leverage(&self, symbol: &str, margin_coin: &str, leverage: u32) {
        let body = json!({ "symbol": symbol, "marginCoin": margin_coin, "leverage": leverage.to_string() });
        if let Err(e) = self.signed_post("/api/v1/futures/account/change_leverage", &body).await {
            log::warn!("[{}] set_leverage failed (best-effort, ignored): {}", symbol, e);
        }
    }

    // ── Order placement (never auto-retried) ─────────────────────────────

    pub async fn open_market(&self, symbol: &str, qty: &str, side: Side) -> Result<String, GatewayError> {
        let body = json!({
            "symbol": symbol,
            "qty": qty,
            "side": side.wire_side(),
            "tradeSide": "OPEN",
            "orderType": "MARKET",
        });
        let data = self.signed_post("/api/v1/futures/trade/place_order", &body).await?;
        extract_order_id(&data)
    }

    pub async fn open_market_with_provisional_sl(&self, symbol: &str, qty: &str, side: Side, sl_price: &str) -> Result<String, GatewayError> {
        let body = json!({
            "symbol": symbol,
            "qty": qty,
            "side": side.wire_side(),
            "tradeSide": "OPEN",
            "orderType": "MARKET",
            "slPrice": sl_price,
        });
        let data = self.signed_post("/api/v1/futures/trade/place_order", &body).await?;
        extract_order_id(&data)
    }

    pub async fn close_market(&self, symbol: &str, qty: &str, side: Side, position_id: &str) -> Result<String, GatewayError> {
        let body = json!({
            "symbol": symbol,
            "qty": qty,
            "side": side.wire_side(),
            "tradeSide": "CLOSE",
            "orderType": "MARKET",
            "positionId": position_id,
            "reduceOnly": true,
        });
        let data = self.signed_post("/api/v1/futures/trade/place_order", &body).await?;
        extract_order_id(&data)
    }

    pub async fn place_position_sl(&self, symbol: &str, position_id: &str, sl_price: &str) -> Result<String, GatewayError> {
        let body = json!({ "symbol": symbol, "positionId": position_id, "slPrice": sl_price });
        let data = self.signed_post("/api/v1/futures/tpsl/position/place_order", &body).await?;
        extract_conditional_id(&data)
    }

    pub async fn modify_position_sl(&self, symbol: &str, position_id: &str, sl_price: &str) -> Result<String, GatewayError> {
        let body = json!({ "symbol": symbol, "positionId": position_id, "slPrice": sl_price });
        let data = self.signed_post("/api/v1/futures/tpsl/position/modify_order", &body).await?;
        extract_conditional_id(&data)
    }

    /// Attempt place; on any failure, attempt modify. Returns the resulting
    /// conditional-order id either way.
    pub async fn ensure_position_sl(&self, symbol: &str, position_id: &str, sl_price: &str) -> Result<String, GatewayError> {
        match self.place_position_sl(symbol, position_id, sl_price).await {
            Ok(id) => Ok(id),
            Err(e) => {
                log::warn!("[{}] place_position_sl failed ({}) — falling back to modify", symbol, e);
                self.modify_position_sl(symbol, position_id, sl_price).await
            }
        }
    }

    pub async fn place_tp_partial(&self, symbol: &str, position_id: &str, tp_price: &str, tp_qty: &str) -> Result<String, GatewayError> {
        let body = json!({
            "symbol": symbol,
            "positionId": position_id,
            "tpPrice": tp_price,
            "qty": tp_qty,
            "reduceOnly": true,
        });
        let data = self.signed_post("/api/v1/futures/tpsl/position/place_order", &body).await?;
        extract_conditional_id(&data)
    }

    /// Cancel a conditional order, tolerating the two wire schemas for the
    /// id field (`orderId` and `id`) before surfacing a failure.
    pub async fn cancel_conditional(&self, symbol: &str, id: &str) -> Result<(), GatewayError> {
        let body_order_id = json!({ "symbol": symbol, "orderId": id });
        match self.signed_post("/api/v1/futures/tpsl/cancel_order", &body_order_id).await {
            Ok(_) => return Ok(()),
            Err(e) => log::debug!("[{}] cancel_conditional with orderId field failed: {}", symbol, e),
        }
        let body_id = json!({ "symbol": symbol, "id": id });
        self.signed_post("/api/v1/futures/tpsl/cancel_order", &body_id).await.map(|_| ())
    }

    /// Poll pending conditionals and select those matching a just-submitted
    /// provisional SL: same symbol, an `slPrice` equal to the submitted
    /// string, no `tpPrice`, positive qty. A conditional is only excluded on
    /// creation time when that time is known and predates `since_ms` — a
    /// missing/unparseable timestamp (`ctime_ms == 0`) is never treated as
    /// stale. Returns after the first non-empty result or `tries` attempts.
    pub async fn capture_provisional_sl_ids(
        &self,
        symbol: &str,
        sl_price_str: &str,
        since_ms: i64,
        tries: u32,
        sleep: Duration,
    ) -> Vec<String> {
        for attempt in 0..tries {
            match self.get_pending_conditionals(Some(symbol), 100).await {
                Ok(list) => {
                    let matches: Vec<String> = list
                        .iter()
                        .filter(|c| {
                            c.symbol == symbol
                                && !(c.ctime_ms != 0 && c.ctime_ms < since_ms)
                                && c.tp_price.is_none()
                                && c.qty > Decimal::ZERO
                                && c.sl_price.map(|p| p.to_string() == sl_price_str).unwrap_or(false)
                        })
                        .map(|c| c.id.clone())
                        .collect();
                    if !matches.is_empty() {
                        return matches;
                    }
                }
                Err(e) => log::warn!("[{}] capture_provisional_sl_ids poll failed: {}", symbol, e),
            }
            if attempt + 1 < tries {
                tokio::time::sleep(sleep).await;
            }
        }
        Vec::new()
    }
}

fn extract_order_id(data: &serde_json::Value) -> Result<String, GatewayError> {
    data["orderId"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::Transient("missing orderId in response".into()))
}

fn extract_conditional_id(data: &serde_json::Value) -> Result<String, GatewayError> {
    data["orderId"]
        .as_str()
        .or_else(|| data["id"].as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::Transient("missing conditional id in response".into()))
}

fn parse_exchange_position(entry: &serde_json::Value) -> Option<ExchangePosition> {
    let side_str = entry["side"].as_str()?;
    let side = match side_str.to_uppercase().as_str() {
        "LONG" | "BUY" => Side::Long,
        "SHORT" | "SELL" => Side::Short,
        _ => return None,
    };
    let qty: Decimal = entry["qty"].as_str()?.parse().ok()?;
    let entry_price: Decimal = entry["entryPrice"].as_str().or_else(|| entry["avgPrice"].as_str())?.parse().ok()?;
    let sl_price = entry["slPrice"].as_str().and_then(|s| s.parse::<Decimal>().ok());
    Some(ExchangePosition {
        position_id: entry["positionId"].as_str().unwrap_or_default().to_string(),
        side,
        qty,
        entry_price,
        sl_price,
    })
}

fn parse_pending_conditional(entry: &serde_json::Value) -> Option<PendingConditional> {
    let id = entry["orderId"].as_str().or_else(|| entry["id"].as_str())?.to_string();
    let symbol = entry["symbol"].as_str()?.to_string();
    let sl_price = entry["slPrice"].as_str().and_then(|s| s.parse::<Decimal>().ok());
    let tp_price = entry["tpPrice"].as_str().and_then(|s| s.parse::<Decimal>().ok());
    let qty = entry["qty"].as_str().and_then(|s| s.parse::<Decimal>().ok()).unwrap_or(Decimal::ZERO);
    let ctime_ms = ["createTime", "ctime", "time", "mtime"]
        .iter()
        .find_map(|k| entry[*k].as_i64().or_else(|| entry[*k].as_str().and_then(|s| s.parse::<i64>().ok())))
        .unwrap_or(0);
    Some(PendingConditional { id, symbol, sl_price, tp_price, qty, ctime_ms })
}

fn parse_order_detail(entry: &serde_json::Value) -> OrderDetail {
    let status = match entry["status"].as_str().unwrap_or("") {
        "NEW" => OrderStatus::New,
        "PART_FILLED" => OrderStatus::PartFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        _ => OrderStatus::Other,
    };
    let trade_qty = entry["tradeQty"]
        .as_str()
        .or_else(|| entry["dealQty"].as_str())
        .and_then(|s| s.parse::<Decimal>().ok())
        .unwrap_or(Decimal::ZERO);
    let avg_price = entry["avgPrice"]
        .as_str()
        .or_else(|| entry["dealPrice"].as_str())
        .or_else(|| entry["tradePrice"].as_str())
        .and_then(|s| s.parse::<Decimal>().ok());
    let deal_money = entry["dealMoney"].as_str().and_then(|s| s.parse::<Decimal>().ok());
    OrderDetail { status, trade_qty, avg_price, deal_money }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_order_id_reads_orderid() {
        let data = json!({ "orderId": "abc123" });
        assert_eq!(extract_order_id(&data).unwrap(), "abc123");
    }

    #[test]
    fn extract_conditional_id_falls_back_to_id_field() {
        let data = json!({ "id": "xyz" });
        assert_eq!(extract_conditional_id(&data).unwrap(), "xyz");
    }

    #[test]
    fn parse_order_detail_reads_synonym_keys() {
        let entry = json!({ "status": "FILLED", "tradeQty": "0.500", "avgPrice": "100.00" });
        let detail = parse_order_detail(&entry);
        assert_eq!(detail.status, OrderStatus::Filled);
        assert_eq!(detail.trade_qty, Decimal::new(500, 3));
        assert_eq!(detail.avg_price, Some(Decimal::new(10000, 2)));
    }

    #[test]
    fn parse_order_detail_canceled_is_distinguishable() {
        let entry = json!({ "status": "CANCELED", "tradeQty": "0" });
        let detail = parse_order_detail(&entry);
        assert_eq!(detail.status, OrderStatus::Canceled);
    }

    #[test]
    fn parse_exchange_position_accepts_long_and_short() {
        let long_entry = json!({ "side": "LONG", "qty": "1.000", "entryPrice": "100.00", "positionId": "P1" });
        let pos = parse_exchange_position(&long_entry).unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.position_id, "P1");

        let short_entry = json!({ "side": "SHORT", "qty": "1.000", "entryPrice": "50.00", "positionId": "P2" });
        let pos = parse_exchange_position(&short_entry).unwrap();
        assert_eq!(pos.side, Side::Short);
    }

    #[test]
    fn parse_pending_conditional_separates_sl_and_tp() {
        let sl_entry = json!({ "orderId": "S1", "symbol": "BTCUSDT", "slPrice": "99.00", "qty": "0.5", "ctime": 1000 });
        let c = parse_pending_conditional(&sl_entry).unwrap();
        assert_eq!(c.sl_price, Some(Decimal::new(9900, 2)));
        assert!(c.tp_price.is_none());
    }
}
