//! The single inbound HTTP surface (§4.7 / §6): `POST /webhook` and
//! `GET /health`, built on the same hyper + hyper-util + http-body-util
//! stack the rest of the pack uses for its own HTTP servers, generalized
//! from a metrics exporter to a signal ingester.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;

use crate::ingest;
use crate::scheduler::Scheduler;

/// Bind `listen_addr` and serve forever, one spawned task per connection.
pub async fn serve(listen_addr: SocketAddr, scheduler: Arc<Scheduler>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    log::info!("webhook server listening on http://{}", listen_addr);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("failed to accept connection: {}", e);
                continue;
            }
        };

        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let scheduler = scheduler.clone();
                async move { handle_request(req, scheduler).await }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                log::debug!("connection error from {}: {}", remote_addr, err);
            }
        });
    }
}

async fn handle_request(req: Request<Incoming>, scheduler: Arc<Scheduler>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if method == hyper::Method::GET && path == "/health" {
        return Ok(json_response(StatusCode::OK, &json!({ "ok": true })));
    }

    if method == hyper::Method::POST && path == "/webhook" {
        let body_bytes = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                log::warn!("failed to read webhook body: {}", e);
                return Ok(bad_request("could not read request body"));
            }
        };
        let raw = String::from_utf8_lossy(&body_bytes);
        return Ok(handle_webhook(&raw, &scheduler).await);
    }

    Ok(json_response(StatusCode::NOT_FOUND, &json!({ "ok": false, "error": "not found" })))
}

async fn handle_webhook(raw: &str, scheduler: &Scheduler) -> Response<Full<Bytes>> {
    let fields = ingest::parse_body(raw);
    if fields.is_empty() {
        return bad_request("empty or invalid body");
    }

    let (symbol, signal) = ingest::resolve_symbol_and_signal(&fields);
    if symbol.is_empty() {
        return bad_request("missing symbol/ticker and could not infer one from content");
    }
    let symbol = ingest::map_symbol_to_known(&symbol, |s| scheduler.is_known_symbol(s));
    let signal = match signal {
        Some(s) => s,
        None => return bad_request("invalid or undetected signal (expected LONG/SHORT/BUY_TP/SELL_TP)"),
    };

    let accepted = scheduler.enqueue(&symbol, signal).await;
    if !accepted {
        return json_response(
            StatusCode::TOO_MANY_REQUESTS,
            &json!({ "ok": false, "error": format!("queue full for {}", symbol) }),
        );
    }

    json_response(
        StatusCode::OK,
        &json!({ "ok": true, "enqueued": true, "symbol": symbol, "signal": signal.as_str() }),
    )
}

fn bad_request(msg: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &json!({ "ok": false, "error": msg }))
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_carries_message_and_400() {
        let resp = bad_request("missing symbol");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
