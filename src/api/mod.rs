//! HTTP API over the message store.
//!
//! Thin glue mapping routes onto the store contract:
//!
//! - `GET /messages?start=&limit=`      → list
//! - `GET /messages/{id}`               → load
//! - `DELETE /messages`                 → delete all
//! - `DELETE /messages/{id}`            → delete one
//! - `GET /search?kind=&query=&start=&limit=` → search
//! - `GET /events`                      → long-poll for the next insert
//!
//! The store knows nothing about HTTP; everything here is translation.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use log::{error, info};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::message::Message;
use crate::storage::{InMemory, StoreError};

/// Page size when the client does not say otherwise.
const DEFAULT_PAGE_LIMIT: usize = 50;

/// How long `GET /events` waits for an insert before returning 204.
const EVENTS_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// One page of a list or search result.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MessagePage {
    total: usize,
    count: usize,
    start: usize,
    items: Vec<Message>,
}

/// Runs the HTTP API server until the shutdown channel fires.
pub async fn run_api_server(
    config: Config,
    store: Arc<InMemory>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let addr_str = format!("{}:{}", config.api_bind_address, config.api_port);
    let addr: SocketAddr = addr_str
        .parse()
        .with_context(|| format!("invalid API bind address {}", addr_str))?;

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API server to {}", addr_str))?;

    info!("HTTP API listening on {}", addr_str);

    let mut shutdown_rx = shutdown.subscribe();
    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted.context("failed to accept API connection")?,
            _ = shutdown_rx.recv() => {
                info!("HTTP API stopping");
                return Ok(());
            }
        };

        let io = TokioIo::new(stream);
        let store = Arc::clone(&store);
        let service = hyper::service::service_fn(move |req| {
            let store = Arc::clone(&store);
            async move { handle_request(req, store).await }
        });

        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!("Error serving API connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    store: Arc<InMemory>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));

    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/messages") => {
            let (start, limit) = page_bounds(&query);
            let (items, total) = store.list(start, limit).await;
            json_page(items, total, start)
        }
        (&Method::DELETE, "/messages") => {
            store.delete_all().await;
            empty_response(StatusCode::OK)
        }
        (&Method::GET, "/search") => {
            let kind = query.get("kind").map(String::as_str).unwrap_or("");
            let needle = query.get("query").map(String::as_str).unwrap_or("");
            let (start, limit) = page_bounds(&query);
            let (items, total) = store.search(kind, needle, start, limit).await;
            json_page(items, total, start)
        }
        (&Method::GET, "/events") => next_event(&store).await,
        (method, path) => match path.strip_prefix("/messages/") {
            Some(id) if !id.is_empty() => match *method {
                Method::GET => match store.load(id).await {
                    Some(message) => json_response(StatusCode::OK, &message),
                    None => empty_response(StatusCode::NOT_FOUND),
                },
                Method::DELETE => match store.delete_one(id).await {
                    Ok(()) => empty_response(StatusCode::OK),
                    Err(StoreError::NotFound) => empty_response(StatusCode::NOT_FOUND),
                },
                _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
            },
            _ => empty_response(StatusCode::NOT_FOUND),
        },
    };

    Ok(response)
}

/// Waits for the next stored message and returns its event, or 204 when
/// nothing arrives within the poll window.
async fn next_event(store: &InMemory) -> Response<Full<Bytes>> {
    let mut events = store.subscribe();
    match tokio::time::timeout(EVENTS_POLL_TIMEOUT, events.recv()).await {
        Ok(Ok(event)) => json_response(StatusCode::OK, &event),
        // Lagged or closed receivers and quiet windows look the same to
        // the poller: come back for the next round.
        Ok(Err(_)) | Err(_) => empty_response(StatusCode::NO_CONTENT),
    }
}

fn page_bounds(query: &HashMap<String, String>) -> (usize, usize) {
    let start = query
        .get("start")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let limit = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PAGE_LIMIT);
    (start, limit)
}

fn json_page(items: Vec<Message>, total: usize, start: usize) -> Response<Full<Bytes>> {
    let page = MessagePage {
        total,
        count: items.len(),
        start,
        items,
    };
    json_response(StatusCode::OK, &page)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => {
            error!("Failed to serialize API response: {}", e);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Splits a query string into decoded key/value pairs. Handles `+` and
/// percent escapes; enough for the API's own parameters.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                match bytes.get(i + 1..i + 3).and_then(|hex| {
                    u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()
                }) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_decodes_pairs() {
        let parsed = parse_query("kind=containing&query=quick+brown%20fox&start=2");
        assert_eq!(parsed.get("kind").unwrap(), "containing");
        assert_eq!(parsed.get("query").unwrap(), "quick brown fox");
        assert_eq!(parsed.get("start").unwrap(), "2");
    }

    #[test]
    fn parse_query_tolerates_empty_and_bare_keys() {
        let parsed = parse_query("");
        assert!(parsed.is_empty());

        let parsed = parse_query("flag&x=1");
        assert_eq!(parsed.get("flag").unwrap(), "");
        assert_eq!(parsed.get("x").unwrap(), "1");
    }

    #[test]
    fn percent_decode_leaves_malformed_escapes() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("a%zzb"), "a%zzb");
        assert_eq!(percent_decode("%41"), "A");
    }

    #[test]
    fn page_bounds_defaults() {
        let (start, limit) = page_bounds(&HashMap::new());
        assert_eq!(start, 0);
        assert_eq!(limit, DEFAULT_PAGE_LIMIT);

        let mut query = HashMap::new();
        query.insert("start".to_string(), "7".to_string());
        query.insert("limit".to_string(), "not-a-number".to_string());
        let (start, limit) = page_bounds(&query);
        assert_eq!(start, 7);
        assert_eq!(limit, DEFAULT_PAGE_LIMIT);
    }
}
