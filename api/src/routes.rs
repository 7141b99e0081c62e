/// Login, resolution, and credential route handlers.
///
/// These all answer HTTP 200 with the `{code, msg, data}` envelope; the
/// envelope code tells success from failure.
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use vidrelay_shared::models::{ApiResult, Credentials, QrCode, QrStatus, ResolvedVideo};

use crate::reply::Failure;
use crate::AppState;

// ====== REQUEST TYPES ======

#[derive(Deserialize)]
pub struct VerifyQuery {
    pub qrcodekey: Option<String>,
    pub qrcode_key: Option<String>,
}

#[derive(Deserialize)]
pub struct ResolveQuery {
    pub bvid: Option<String>,
    pub cid: Option<String>,
}

#[derive(Deserialize)]
pub struct LinkQuery {
    pub url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// ====== LOGIN ROUTES ======

/// GET /getQRCode
pub async fn get_qr_code(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResult<QrCode>>, Failure> {
    let qr = state.bilibili.generate_qr().await.map_err(|e| {
        warn!("QR code generation failed: {}", e);
        Failure::ok(e.to_string())
    })?;
    Ok(Json(ApiResult::success(qr)))
}

/// GET /verifyQRCode?qrcodekey=...
pub async fn verify_qr_code(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<ApiResult<QrStatus>>, Failure> {
    let key = non_empty(query.qrcodekey)
        .or_else(|| non_empty(query.qrcode_key))
        .ok_or_else(|| Failure::ok("missing qrcodekey parameter"))?;

    let status = state.bilibili.poll_qr(&key).await.map_err(|e| {
        warn!("QR poll failed: {}", e);
        Failure::ok(e.to_string())
    })?;

    if status.is_confirmed() {
        Ok(Json(ApiResult::success(status)))
    } else {
        // pending states keep the status so the client can keep polling
        Ok(Json(ApiResult::fail_with(status.message.clone(), status)))
    }
}

/// GET /api/cookie/view
pub async fn view_cookie(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResult<Credentials>>, Failure> {
    let creds = state.bilibili.store().load().await.map_err(|e| {
        warn!("Failed to load credentials: {}", e);
        Failure::ok(e.to_string())
    })?;

    if creds.is_empty() {
        return Err(Failure::ok("no cookie stored, scan the QR code first"));
    }
    Ok(Json(ApiResult::success(creds.masked())))
}

// ====== RESOLVE ROUTES ======

/// GET /video/resolve?bvid=...&cid=...
pub async fn resolve_video(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ApiResult<ResolvedVideo>>, Failure> {
    let (Some(bvid), Some(cid)) = (non_empty(query.bvid), non_empty(query.cid)) else {
        return Err(Failure::ok("missing bvid or cid parameter"));
    };
    let cid: u64 = cid
        .parse()
        .map_err(|_| Failure::ok(format!("invalid cid: {}", cid)))?;

    let video = state.bilibili.resolve(&bvid, cid).await.map_err(|e| {
        warn!("Resolve {}/{} failed: {}", bvid, cid, e);
        Failure::ok(format!("resolve failed: {}", e))
    })?;
    Ok(Json(ApiResult::success(video)))
}

/// GET /downloadVideoWBI?url=... - resolve a page link to direct media URLs
pub async fn download_video_wbi(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LinkQuery>,
) -> Result<Json<ApiResult<ResolvedVideo>>, Failure> {
    let link = non_empty(query.url).ok_or_else(|| Failure::ok("missing url parameter"))?;

    let video = state.bilibili.resolve_link(&link).await.map_err(|e| {
        warn!("Resolve {} failed: {}", link, e);
        Failure::ok(format!("resolve failed: {}", e))
    })?;
    Ok(Json(ApiResult::success(video)))
}
