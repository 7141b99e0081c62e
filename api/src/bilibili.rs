/// Video platform client: QR login and play URL resolution.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use vidrelay_shared::cookie_store::CookieStore;
use vidrelay_shared::errors::PlatformError;
use vidrelay_shared::models::{Credentials, QrCode, QrStatus, ResolvedVideo};

/// Referer the origin's media CDN insists on.
pub const REFERER: &str = "https://www.bilibili.com";
/// Desktop browser user agent sent on every outbound request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const API_BASE: &str = "https://api.bilibili.com";
const PASSPORT_BASE: &str = "https://passport.bilibili.com";

/// Mixin keys rotate roughly daily.
const WBI_KEY_TTL: Duration = Duration::from_secs(3600);

const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// encodeURIComponent, minus the characters signing strips anyway.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// ====== RESPONSE TYPES ======

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, PlatformError> {
        if self.code != 0 {
            return Err(PlatformError::Api {
                code: self.code,
                message: self.message,
            });
        }
        self.data
            .ok_or_else(|| PlatformError::Parse("response has no data".to_string()))
    }
}

#[derive(Deserialize)]
struct NavData {
    wbi_img: WbiImg,
}

#[derive(Deserialize)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

#[derive(Deserialize)]
struct ViewData {
    title: String,
    cid: u64,
}

#[derive(Deserialize)]
struct PlayUrlData {
    dash: Option<Dash>,
    #[serde(default)]
    durl: Vec<Durl>,
}

#[derive(Deserialize)]
struct Dash {
    #[serde(default)]
    video: Vec<DashStream>,
    #[serde(default)]
    audio: Option<Vec<DashStream>>,
}

#[derive(Deserialize)]
struct DashStream {
    id: u64,
    #[serde(rename = "baseUrl")]
    base_url: String,
    #[serde(default)]
    bandwidth: u64,
}

#[derive(Deserialize)]
struct Durl {
    url: String,
}

// ====== CLIENT ======

/// Platform client sharing the process-wide HTTP pool.
pub struct BilibiliClient {
    http: reqwest::Client,
    store: Arc<CookieStore>,
    api_base: String,
    passport_base: String,
    wbi_key: RwLock<Option<(String, Instant)>>,
}

impl BilibiliClient {
    pub fn new(http: reqwest::Client, store: Arc<CookieStore>) -> Self {
        Self::with_bases(http, store, API_BASE, PASSPORT_BASE)
    }

    pub fn with_bases(
        http: reqwest::Client,
        store: Arc<CookieStore>,
        api_base: impl Into<String>,
        passport_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store,
            api_base: api_base.into(),
            passport_base: passport_base.into(),
            wbi_key: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<CookieStore> {
        &self.store
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Envelope<T>, PlatformError> {
        let mut req = self
            .http
            .get(url)
            .header(reqwest::header::REFERER, REFERER)
            .header(reqwest::header::USER_AGENT, USER_AGENT);

        let creds = self.store.load().await?;
        if !creds.is_empty() {
            req = req.header(reqwest::header::COOKIE, format!("SESSDATA={}", creds.sess_data));
        }

        debug!("GET {}", url);
        Ok(req.send().await?.error_for_status()?.json().await?)
    }

    // ====== LOGIN ======

    /// Issue a fresh login QR code.
    pub async fn generate_qr(&self) -> Result<QrCode, PlatformError> {
        let url = format!("{}/x/passport-login/web/qrcode/generate", self.passport_base);
        self.get_json::<QrCode>(&url).await?.into_data()
    }

    /// Poll a QR code. On confirmation the credentials are persisted.
    pub async fn poll_qr(&self, qrcode_key: &str) -> Result<QrStatus, PlatformError> {
        let url = format!(
            "{}/x/passport-login/web/qrcode/poll?qrcode_key={}",
            self.passport_base,
            utf8_percent_encode(qrcode_key, COMPONENT)
        );
        let status = self.get_json::<QrStatus>(&url).await?.into_data()?;

        if status.is_confirmed() {
            let creds = credentials_from_redirect(&status.url, &status.refresh_token)?;
            self.store.save(&creds).await?;
            info!("QR login confirmed for user {}", creds.dede_user_id);
        } else {
            debug!("QR {} pending: [{}] {}", qrcode_key, status.code, status.message);
        }

        Ok(status)
    }

    // ====== RESOLUTION ======

    /// Resolve a known bvid/cid pair into playable URLs.
    pub async fn resolve(&self, bvid: &str, cid: u64) -> Result<ResolvedVideo, PlatformError> {
        let view = self.view(bvid).await?;
        self.play_url(bvid, cid, view.title).await
    }

    /// Resolve a video page link (or bare BV id) using its first page.
    pub async fn resolve_link(&self, link: &str) -> Result<ResolvedVideo, PlatformError> {
        let bvid =
            extract_bvid(link).ok_or_else(|| PlatformError::InvalidVideoLink(link.to_string()))?;
        let view = self.view(&bvid).await?;
        self.play_url(&bvid, view.cid, view.title).await
    }

    async fn view(&self, bvid: &str) -> Result<ViewData, PlatformError> {
        let url = format!(
            "{}/x/web-interface/view?bvid={}",
            self.api_base,
            utf8_percent_encode(bvid, COMPONENT)
        );
        self.get_json::<ViewData>(&url).await?.into_data()
    }

    async fn play_url(
        &self,
        bvid: &str,
        cid: u64,
        title: String,
    ) -> Result<ResolvedVideo, PlatformError> {
        let mixin_key = self.current_mixin_key().await?;
        let params = [
            ("bvid", bvid.to_string()),
            ("cid", cid.to_string()),
            ("qn", "80".to_string()),
            ("fnval", "16".to_string()),
            ("fourk", "1".to_string()),
        ];
        let query = sign_params(&params, &mixin_key, Utc::now().timestamp());
        let url = format!("{}/x/player/wbi/playurl?{}", self.api_base, query);
        let data = self.get_json::<PlayUrlData>(&url).await?.into_data()?;

        let (video_url, audio_url) = pick_streams(data)?;
        info!("Resolved {} (cid {}): {}", bvid, cid, title);

        Ok(ResolvedVideo {
            title,
            bvid: bvid.to_string(),
            cid,
            video_url,
            audio_url,
        })
    }

    async fn current_mixin_key(&self) -> Result<String, PlatformError> {
        if let Some((key, fetched)) = self.wbi_key.read().await.as_ref() {
            if fetched.elapsed() < WBI_KEY_TTL {
                return Ok(key.clone());
            }
        }

        // nav answers -101 for anonymous callers but still carries wbi_img
        let url = format!("{}/x/web-interface/nav", self.api_base);
        let nav = self
            .get_json::<NavData>(&url)
            .await?
            .data
            .ok_or_else(|| PlatformError::Parse("nav has no wbi_img".to_string()))?;

        let key = mixin_key(
            key_from_url(&nav.wbi_img.img_url),
            key_from_url(&nav.wbi_img.sub_url),
        );
        *self.wbi_key.write().await = Some((key.clone(), Instant::now()));
        Ok(key)
    }
}

// ====== HELPERS ======

/// Find a BV id in a page link or return the input if it is one.
pub fn extract_bvid(link: &str) -> Option<String> {
    let start = link.find("BV")?;
    let id: String = link[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    // BV + 10 base58 chars
    (id.len() == 12).then_some(id)
}

/// Pull login cookies out of the cross-domain redirect URL, keeping the raw
/// (still percent-encoded) values as the browser would store them.
fn credentials_from_redirect(
    redirect: &str,
    refresh_token: &str,
) -> Result<Credentials, PlatformError> {
    let query = redirect
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| PlatformError::Parse(format!("no query in redirect {}", redirect)))?;

    let mut creds = Credentials {
        refresh_token: refresh_token.to_string(),
        updated_at: Some(Utc::now()),
        ..Default::default()
    };
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("SESSDATA", v)) => creds.sess_data = v.to_string(),
            Some(("bili_jct", v)) => creds.bili_jct = v.to_string(),
            Some(("DedeUserID", v)) => creds.dede_user_id = v.to_string(),
            _ => {}
        }
    }

    if creds.is_empty() {
        return Err(PlatformError::Parse("redirect carries no SESSDATA".to_string()));
    }
    Ok(creds)
}

fn pick_streams(data: PlayUrlData) -> Result<(String, Option<String>), PlatformError> {
    if let Some(dash) = data.dash {
        let video = dash.video.into_iter().max_by_key(|s| (s.id, s.bandwidth));
        if let Some(video) = video {
            let audio = dash
                .audio
                .unwrap_or_default()
                .into_iter()
                .max_by_key(|s| (s.bandwidth, s.id))
                .map(|s| s.base_url);
            return Ok((video.base_url, audio));
        }
    }

    data.durl
        .into_iter()
        .next()
        .map(|d| (d.url, None))
        .ok_or_else(|| PlatformError::Parse("no playable stream".to_string()))
}

/// File stem of a wbi image URL, e.g. `.../7cd0...077c.png` -> `7cd0...077c`.
fn key_from_url(url: &str) -> &str {
    let file = url.rsplit('/').next().unwrap_or(url);
    file.split('.').next().unwrap_or(file)
}

fn mixin_key(img_key: &str, sub_key: &str) -> String {
    let raw: Vec<char> = img_key.chars().chain(sub_key.chars()).collect();
    MIXIN_KEY_ENC_TAB
        .iter()
        .filter_map(|&i| raw.get(i))
        .take(32)
        .collect()
}

/// Build a WBI-signed query string: sorted params, `wts`, then `w_rid`.
fn sign_params(params: &[(&str, String)], mixin_key: &str, wts: i64) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| {
            let cleaned: String = v.chars().filter(|c| !"!'()*".contains(*c)).collect();
            (k.to_string(), cleaned)
        })
        .collect();
    pairs.push(("wts".to_string(), wts.to_string()));
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let query = pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, COMPONENT),
                utf8_percent_encode(v, COMPONENT)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    let w_rid = format!("{:x}", md5::compute(format!("{}{}", query, mixin_key)));
    format!("{}&w_rid={}", query, w_rid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const IMG_KEY: &str = "7cd084941338484aae1ad9425b84077c";
    const SUB_KEY: &str = "4932caff0ff746eab6f01bf08b70ac45";

    async fn spawn_platform(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_mixin_key() {
        assert_eq!(mixin_key(IMG_KEY, SUB_KEY), "ea1db124af3c7062474693fa704f4ff8");
        assert_eq!(
            key_from_url("https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png"),
            IMG_KEY
        );
    }

    #[test]
    fn test_sign_params() {
        let key = mixin_key(IMG_KEY, SUB_KEY);
        let params = [
            ("foo", "114".to_string()),
            ("bar", "514".to_string()),
            ("zab", "1919810".to_string()),
        ];
        assert_eq!(
            sign_params(&params, &key, 1702204169),
            "bar=514&foo=114&wts=1702204169&zab=1919810&w_rid=8f6f2b5b3d485fe1886cec6a0be8c5d4"
        );
    }

    #[test]
    fn test_sign_params_strips_and_encodes() {
        let key = mixin_key(IMG_KEY, SUB_KEY);
        let params = [
            ("bvid", "BV1xx411c7mD".to_string()),
            ("cid", "12345".to_string()),
            ("fnval", "16".to_string()),
            ("q", "a b!'()*c".to_string()),
        ];
        assert_eq!(
            sign_params(&params, &key, 1700000000),
            "bvid=BV1xx411c7mD&cid=12345&fnval=16&q=a%20bc&wts=1700000000&w_rid=e6a510b619a18e71cef92055f8039297"
        );
    }

    #[test]
    fn test_extract_bvid() {
        assert_eq!(
            extract_bvid("https://www.bilibili.com/video/BV1xx411c7mD/?p=2"),
            Some("BV1xx411c7mD".to_string())
        );
        assert_eq!(extract_bvid("BV1xx411c7mD"), Some("BV1xx411c7mD".to_string()));
        assert_eq!(extract_bvid("https://www.bilibili.com/video/av170001"), None);
        assert_eq!(extract_bvid("BV123"), None);
    }

    #[test]
    fn test_credentials_from_redirect() {
        let url = "https://passport.biligame.com/x/passport-login/web/crossDomain?DedeUserID=42&DedeUserID__ckMd5=ab&Expires=1&SESSDATA=abc%2C123%2Cxyz&bili_jct=jct0&gourl=https%3A%2F%2Fwww.bilibili.com";
        let creds = credentials_from_redirect(url, "rt").unwrap();
        assert_eq!(creds.sess_data, "abc%2C123%2Cxyz");
        assert_eq!(creds.bili_jct, "jct0");
        assert_eq!(creds.dede_user_id, "42");
        assert_eq!(creds.refresh_token, "rt");

        assert!(credentials_from_redirect("https://example.com/?a=b", "").is_err());
    }

    #[test]
    fn test_pick_streams_prefers_best_dash() {
        let data: PlayUrlData = serde_json::from_value(serde_json::json!({
            "dash": {
                "video": [
                    {"id": 32, "baseUrl": "v480", "base_url": "v480", "bandwidth": 100},
                    {"id": 80, "baseUrl": "v1080", "base_url": "v1080", "bandwidth": 900},
                    {"id": 64, "baseUrl": "v720", "base_url": "v720", "bandwidth": 500}
                ],
                "audio": [
                    {"id": 30216, "baseUrl": "a64", "bandwidth": 64000},
                    {"id": 30280, "baseUrl": "a192", "bandwidth": 192000}
                ]
            }
        }))
        .unwrap();
        let (video, audio) = pick_streams(data).unwrap();
        assert_eq!(video, "v1080");
        assert_eq!(audio.as_deref(), Some("a192"));
    }

    #[test]
    fn test_pick_streams_falls_back_to_durl() {
        let data: PlayUrlData = serde_json::from_value(serde_json::json!({
            "dash": null,
            "durl": [{"url": "flv-1"}]
        }))
        .unwrap();
        assert_eq!(pick_streams(data).unwrap(), ("flv-1".to_string(), None));
    }

    #[tokio::test]
    async fn test_poll_qr_persists_credentials() {
        let app = Router::new().route(
            "/x/passport-login/web/qrcode/poll",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let confirmed = q.get("qrcode_key").map(String::as_str) == Some("ok");
                let (code, message, url) = if confirmed {
                    (0, "", "https://x/?DedeUserID=7&SESSDATA=s3ss&bili_jct=j")
                } else {
                    (86101, "not scanned", "")
                };
                Json(serde_json::json!({
                    "code": 0,
                    "message": "0",
                    "data": {
                        "code": code,
                        "message": message,
                        "url": url,
                        "refresh_token": "rt",
                        "timestamp": 0
                    }
                }))
            }),
        );
        let base = spawn_platform(app).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CookieStore::new(dir.path().join("cookie.json")));
        let client = BilibiliClient::with_bases(reqwest::Client::new(), store.clone(), &base, &base);

        let pending = client.poll_qr("waiting").await.unwrap();
        assert!(!pending.is_confirmed());
        assert!(store.load().await.unwrap().is_empty());

        let done = client.poll_qr("ok").await.unwrap();
        assert!(done.is_confirmed());
        let saved = store.load().await.unwrap();
        assert_eq!(saved.sess_data, "s3ss");
        assert_eq!(saved.dede_user_id, "7");
    }

    #[tokio::test]
    async fn test_resolve_link_signs_and_sends_cookie() {
        let seen: Arc<Mutex<Vec<(HashMap<String, String>, Option<String>)>>> = Arc::default();
        let seen_play = seen.clone();

        let app = Router::new()
            .route(
                "/x/web-interface/nav",
                get(|| async {
                    Json(serde_json::json!({
                        "code": -101,
                        "message": "not logged in",
                        "data": {"wbi_img": {
                            "img_url": "https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png",
                            "sub_url": "https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png"
                        }}
                    }))
                }),
            )
            .route(
                "/x/web-interface/view",
                get(|| async {
                    Json(serde_json::json!({
                        "code": 0, "message": "0",
                        "data": {"bvid": "BV1xx411c7mD", "title": "Demo", "cid": 777}
                    }))
                }),
            )
            .route(
                "/x/player/wbi/playurl",
                get(move |Query(q): Query<HashMap<String, String>>, headers: HeaderMap| {
                    let seen = seen_play.clone();
                    async move {
                        let cookie = headers
                            .get("cookie")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        seen.lock().unwrap().push((q, cookie));
                        Json(serde_json::json!({
                            "code": 0, "message": "0",
                            "data": {"durl": [{"url": "https://cdn.example/v.flv"}]}
                        }))
                    }
                }),
            );
        let base = spawn_platform(app).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CookieStore::new(dir.path().join("cookie.json")));
        store
            .save(&Credentials {
                sess_data: "s3ss".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let client = BilibiliClient::with_bases(reqwest::Client::new(), store, &base, &base);

        let video = client
            .resolve_link("https://www.bilibili.com/video/BV1xx411c7mD")
            .await
            .unwrap();
        assert_eq!(video.title, "Demo");
        assert_eq!(video.cid, 777);
        assert_eq!(video.video_url, "https://cdn.example/v.flv");
        assert!(video.audio_url.is_none());

        let seen = seen.lock().unwrap();
        let (query, cookie) = &seen[0];
        assert_eq!(query.get("cid").map(String::as_str), Some("777"));
        assert!(query.contains_key("wts"));
        assert_eq!(query.get("w_rid").map(String::len), Some(32));
        assert_eq!(cookie.as_deref(), Some("SESSDATA=s3ss"));
    }

    #[tokio::test]
    async fn test_api_error_surfaces_code() {
        let app = Router::new().route(
            "/x/web-interface/view",
            get(|| async { Json(serde_json::json!({"code": -404, "message": "nothing here", "data": null})) }),
        );
        let base = spawn_platform(app).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CookieStore::new(dir.path().join("cookie.json")));
        let client = BilibiliClient::with_bases(reqwest::Client::new(), store, &base, &base);

        let err = client.resolve_link("BV1xx411c7mD").await.unwrap_err();
        assert!(matches!(err, PlatformError::Api { code: -404, .. }));
    }

    #[tokio::test]
    async fn test_view_encodes_bvid() {
        let seen: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::default();
        let seen_view = seen.clone();
        let app = Router::new().route(
            "/x/web-interface/view",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let seen = seen_view.clone();
                async move {
                    seen.lock().unwrap().push(q);
                    Json(serde_json::json!({"code": -400, "message": "bad bvid", "data": null}))
                }
            }),
        );
        let base = spawn_platform(app).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CookieStore::new(dir.path().join("cookie.json")));
        let client = BilibiliClient::with_bases(reqwest::Client::new(), store, &base, &base);

        let err = client.resolve("BV1xx&cid=9 x", 5).await.unwrap_err();
        assert!(matches!(err, PlatformError::Api { code: -400, .. }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].len(), 1, "caller input must not add parameters");
        assert_eq!(seen[0]["bvid"], "BV1xx&cid=9 x");
    }
}
