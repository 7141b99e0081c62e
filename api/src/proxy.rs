/// Stream relay: fetch an origin resource with the headers the origin
/// demands and forward the body to the client as it arrives.
use std::io;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

use vidrelay_shared::errors::RelayError;
use vidrelay_shared::models::ProgressEvent;

use crate::bilibili::{REFERER, USER_AGENT};
use crate::progress::ProgressChannel;
use crate::reply::Failure;
use crate::AppState;

/// Working buffer for the body copy.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Connection-scoped headers owned by the server's own framing.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Deserialize)]
pub struct RelayQuery {
    pub url: Option<String>,
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

/// Reports forwarded bytes as progress events for one relayed file.
pub struct ProgressTap {
    channel: Arc<ProgressChannel>,
    file_name: String,
}

impl ProgressTap {
    pub fn new(channel: Arc<ProgressChannel>, file_name: impl Into<String>) -> Self {
        Self {
            channel,
            file_name: file_name.into(),
        }
    }

    /// Publish once per whole percent crossed.
    fn wrap<S>(self, body: S, total: u64) -> impl Stream<Item = io::Result<Bytes>> + Send
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let mut forwarded = 0u64;
        let mut reported: Option<u64> = None;

        body.then(move |chunk| {
            let event = match &chunk {
                Ok(bytes) => {
                    forwarded += bytes.len() as u64;
                    let percent = forwarded.min(total) * 100 / total;
                    if reported != Some(percent) {
                        reported = Some(percent);
                        Some(ProgressEvent::new(self.file_name.clone(), percent as f64))
                    } else {
                        None
                    }
                }
                Err(_) => None,
            };
            let channel = self.channel.clone();
            async move {
                if let Some(event) = event {
                    channel.publish(&event).await;
                }
                chunk
            }
        })
    }
}

/// GET /proxy?url=...[&fileName=...]
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RelayQuery>, QueryRejection>,
) -> Result<Response, Failure> {
    let Query(query) = query.map_err(|rejection| {
        warn!("Rejected relay query: {}", rejection.body_text());
        Failure::from(RelayError::BadRequest)
    })?;
    let target = query.url.unwrap_or_default();
    let tap = query
        .file_name
        .filter(|name| !name.is_empty())
        .map(|name| ProgressTap::new(state.progress.clone(), name));

    relay(&state.http, &target, tap).await.map_err(|e| {
        warn!("Relay of '{}' failed: {}", target, e);
        Failure::from(e)
    })
}

/// Validate the target and build the outbound request. No network I/O.
pub fn build_request(
    client: &reqwest::Client,
    target: &str,
) -> Result<reqwest::Request, RelayError> {
    if target.is_empty() {
        return Err(RelayError::BadRequest);
    }

    let url = url::Url::parse(target)
        .map_err(|e| RelayError::InvalidTarget(format!("{} ({})", target, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RelayError::InvalidTarget(format!(
            "{} (unsupported scheme)",
            target
        )));
    }

    client
        .get(url)
        .header(header::REFERER, REFERER)
        .header(header::USER_AGENT, USER_AGENT)
        .build()
        .map_err(|e| RelayError::InvalidTarget(e.to_string()))
}

/// Fetch `target` and turn the upstream response into a streaming response.
///
/// Status and headers are mirrored (ACAO forced to `*`), the body is copied
/// through a fixed buffer. The upstream response lives inside the body
/// stream, so it is released when the copy finishes, fails, or the client
/// goes away and the server drops the body.
pub async fn relay(
    client: &reqwest::Client,
    target: &str,
    tap: Option<ProgressTap>,
) -> Result<Response, RelayError> {
    let request = build_request(client, target)?;

    let upstream = client
        .execute(request)
        .await
        .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;

    let status = upstream.status();
    let total = upstream.content_length();
    let headers = forward_headers(upstream.headers());
    info!("Relaying {} -> {} ({:?} bytes)", target, status, total);

    let source = upstream
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let logged_target = target.to_string();
    let copied = ReaderStream::with_capacity(StreamReader::new(source), RELAY_BUFFER_SIZE)
        .inspect_err(move |e| {
            warn!(
                "{} while relaying {}",
                RelayError::StreamInterrupted(e.to_string()),
                logged_target
            )
        });

    let body = match (tap, total) {
        (Some(_), _) if !status.is_success() => {
            debug!("Upstream answered {} for {}, progress not reported", status, target);
            Body::from_stream(copied)
        }
        (Some(tap), Some(total)) if total > 0 => Body::from_stream(tap.wrap(copied, total)),
        (Some(_), _) => {
            debug!("No content length for {}, progress not reported", target);
            Body::from_stream(copied)
        }
        (None, _) => Body::from_stream(copied),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Copy upstream headers except ACAO and hop-by-hop ones, then set ACAO `*`.
fn forward_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        if *name == header::ACCESS_CONTROL_ALLOW_ORIGIN || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}
