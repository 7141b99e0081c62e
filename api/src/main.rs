/// Vidrelay API Server
///
/// Local backend for the browser downloader: relays QR login, resolves
/// signed media URLs, streams media bytes past the origin's referer checks,
/// and pushes transfer progress over a WebSocket.
mod bilibili;
mod config;
mod progress;
mod proxy;
mod reply;
mod routes;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use vidrelay_shared::cookie_store::CookieStore;

use bilibili::BilibiliClient;
use config::Config;
use progress::ProgressChannel;

/// Shared application state for all handlers.
pub struct AppState {
    pub progress: Arc<ProgressChannel>,
    pub http: reqwest::Client,
    pub bilibili: BilibiliClient,
}

fn router(state: Arc<AppState>) -> Router {
    // CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Login
        .route("/getQRCode", get(routes::get_qr_code))
        .route("/verifyQRCode", get(routes::verify_qr_code))
        .route("/api/cookie/view", get(routes::view_cookie))
        // Resolution
        .route("/video/resolve", get(routes::resolve_video))
        .route("/downloadVideoWBI", get(routes::download_video_wbi))
        // Streaming
        .route("/proxy", get(proxy::proxy))
        .route("/progress", get(progress::progress_ws))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vidrelay_api=info,vidrelay_shared=info,tower_http=info".into()
            }),
        )
        .init();

    let config = Config::from_env();
    info!("Credential file: {}", config.cookie_path.display());
    if config.upstream_connect_timeout.is_none() {
        info!("No upstream connect timeout configured");
    }

    let http = config.http_client()?;
    let store = Arc::new(CookieStore::new(config.cookie_path.clone()));

    let state = Arc::new(AppState {
        progress: Arc::new(ProgressChannel::new()),
        bilibili: BilibiliClient::new(http.clone(), store),
        http,
    });

    let app = router(state);

    // Bind
    let addr = config.bind_addr();
    info!("Vidrelay API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Fresh state with its own credential file and no network configuration.
/// The credential directory lives as long as the returned guard.
#[cfg(test)]
fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CookieStore::new(dir.path().join("cookie.json")));

    let http = reqwest::Client::new();
    let state = Arc::new(AppState {
        progress: Arc::new(ProgressChannel::new()),
        bilibili: BilibiliClient::new(http.clone(), store),
        http,
    });
    (state, dir)
}
