// Minimal Chrome DevTools Protocol driver for interactive sign-in
//
// Launch -> Load -> AwaitNavigation -> HarvestCookies -> Close

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{AuthError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WINDOW_WIDTH: u32 = 580;
const WINDOW_HEIGHT: u32 = 530;
const NAVIGATION_POLL: Duration = Duration::from_millis(500);
const PORT_FILE_POLL: Duration = Duration::from_millis(100);

const CHROME_CANDIDATES: [&str; 7] = [
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "microsoft-edge",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
];

/// Stages of an interactive sign-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Launch,
    Load,
    AwaitNavigation,
    HarvestCookies,
    Close,
}

/// Cookie as reported by `Network.getCookies`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    /// Unix seconds, `-1` for session cookies
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn session_expiry() -> f64 {
    -1.0
}

impl BrowserCookie {
    /// `Network.setCookie` parameters
    fn set_params(&self) -> Value {
        let mut params = json!({
            "name": self.name,
            "value": self.value,
            "domain": self.domain,
            "path": if self.path.is_empty() { "/" } else { self.path.as_str() },
            "secure": self.secure,
            "httpOnly": self.http_only,
        });
        if self.expires > 0.0 {
            params["expires"] = json!(self.expires);
        }
        params
    }
}

/// Browser launch options
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub chrome_path: Option<PathBuf>,
    /// Extra switches, passed as `--key=value`
    pub args: BTreeMap<String, String>,
}

/// Command line switches for an app-mode window on `start_url`
pub fn chrome_args(profile: &Path, start_url: &str, extra: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = vec![
        "--remote-debugging-port=0".to_string(),
        "--remote-allow-origins=*".to_string(),
        format!("--user-data-dir={}", profile.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-extensions".to_string(),
        format!("--window-size={},{}", WINDOW_WIDTH, WINDOW_HEIGHT),
        format!("--app={}", start_url),
    ];
    for (key, value) in extra {
        let key = key.trim_start_matches('-');
        if key.is_empty() {
            continue;
        }
        args.push(format!("--{}={}", key, value));
    }
    args
}

/// Placeholder page shown while the site loads
pub fn start_page(site_url: &str) -> String {
    let html = format!(
        "<html><head><title>Connecting to site: {}</title></head>\
         <body style=\"background:#4b4242;color:#fff;font-family:sans-serif;text-align:center\">\
         <h1 style=\"margin-top:160px\">Connecting to site</h1></body></html>",
        crate::templates::escape_param(site_url)
    );
    format!("data:text/html;base64,{}", STANDARD.encode(html))
}

/// Parse `DevToolsActivePort`: the port, then the browser target path
pub fn parse_active_port(content: &str) -> Option<u16> {
    content.lines().next()?.trim().parse().ok()
}

fn find_chrome(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("CHROME_PATH") {
        return Ok(PathBuf::from(path));
    }

    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    for candidate in CHROME_CANDIDATES {
        let candidate = Path::new(candidate);
        if candidate.is_absolute() {
            if candidate.exists() {
                return Ok(candidate.to_path_buf());
            }
            continue;
        }
        if let Some(found) = path_dirs.iter().map(|d| d.join(candidate)).find(|p| p.exists()) {
            return Ok(found);
        }
    }

    Err(AuthError::Config(
        "Chrome not found; set chromePath in the config or CHROME_PATH".to_string(),
    ))
}

/// A launched browser; killed on drop
pub struct Browser {
    child: Child,
    _profile: tempfile::TempDir,
    port: u16,
}

impl Browser {
    /// Start Chrome with a throwaway profile and wait for its debugging port
    pub async fn launch(options: &LaunchOptions, start_url: &str) -> Result<Self> {
        let chrome = find_chrome(options.chrome_path.as_deref())?;
        let profile = tempfile::Builder::new().prefix("spauth-chrome").tempdir()?;
        let args = chrome_args(profile.path(), start_url, &options.args);
        tracing::debug!("Launching {} {:?}", chrome.display(), args);

        let mut child = Command::new(&chrome)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AuthError::Config(format!("Cannot start {}: {}", chrome.display(), e)))?;

        let port_file = profile.path().join("DevToolsActivePort");
        let port = loop {
            if let Ok(content) = tokio::fs::read_to_string(&port_file).await {
                if let Some(port) = parse_active_port(&content) {
                    break port;
                }
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(AuthError::Protocol(format!("Browser exited early: {}", status)));
            }
            tokio::time::sleep(PORT_FILE_POLL).await;
        };

        Ok(Self {
            child,
            _profile: profile,
            port,
        })
    }

    /// Attach to the first page target
    pub async fn page(&self, client: &reqwest::Client) -> Result<CdpSession> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Target {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            web_socket_debugger_url: String,
        }

        let list_url = format!("http://127.0.0.1:{}/json/list", self.port);
        let targets: Vec<Target> = client.get(&list_url).send().await?.json().await?;
        let ws_url = targets
            .into_iter()
            .find(|t| t.kind == "page" && !t.web_socket_debugger_url.is_empty())
            .map(|t| t.web_socket_debugger_url)
            .ok_or_else(|| AuthError::Protocol("Browser has no page target".to_string()))?;

        CdpSession::connect(&ws_url).await
    }

    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("Browser already gone: {}", e);
        }
    }
}

/// JSON-RPC session with one DevTools target
pub struct CdpSession {
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
    next_id: u64,
}

impl CdpSession {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| AuthError::Protocol(format!("DevTools connection failed: {}", e)))?;
        let (write, read) = socket.split();
        Ok(Self {
            write,
            read,
            next_id: 0,
        })
    }

    /// Send a command and wait for its result, skipping unrelated events
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({ "id": id, "method": method, "params": params });

        self.write
            .send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| closed(method, e))?;

        while let Some(msg) = self.read.next().await {
            let msg = msg.map_err(|e| closed(method, e))?;
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let payload: Value = match serde_json::from_str(text.as_str()) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if payload["id"].as_u64() != Some(id) {
                continue;
            }
            if let Some(error) = payload.get("error") {
                return Err(AuthError::Protocol(format!(
                    "{} failed: {}",
                    method,
                    error["message"].as_str().unwrap_or("unknown error")
                )));
            }
            return Ok(payload["result"].clone());
        }

        Err(AuthError::Protocol(
            "Browser window closed before sign-in completed".to_string(),
        ))
    }

    pub async fn set_cookies(&mut self, cookies: &[BrowserCookie]) -> Result<()> {
        for cookie in cookies {
            self.call("Network.setCookie", cookie.set_params()).await?;
        }
        Ok(())
    }

    pub async fn navigate(&mut self, url: &str) -> Result<()> {
        self.call("Page.navigate", json!({ "url": url })).await.map(|_| ())
    }

    pub async fn location(&mut self) -> Result<String> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": "window.location.href", "returnByValue": true }),
            )
            .await?;
        Ok(result["result"]["value"].as_str().unwrap_or_default().to_string())
    }

    pub async fn cookies(&mut self) -> Result<Vec<BrowserCookie>> {
        let result = self.call("Network.getCookies", json!({})).await?;
        serde_json::from_value(result["cookies"].clone())
            .map_err(|e| AuthError::Protocol(format!("Invalid cookie list: {}", e)))
    }
}

fn closed(method: &str, e: impl std::fmt::Display) -> AuthError {
    AuthError::Protocol(format!("Browser connection lost during {}: {}", method, e))
}

/// Whether `current` is the site itself or a page below it
fn is_on_site(current: &str, site: &Url) -> bool {
    let current = match Url::parse(current) {
        Ok(url) => url,
        Err(_) => return false,
    };
    if current.origin() != site.origin() {
        return false;
    }
    let prefix = site.path().trim_end_matches('/').to_lowercase();
    let path = current.path().to_lowercase();
    prefix.is_empty() || path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Load the site, wait until the page is back on it, then read its cookies
pub async fn sign_in(
    session: &mut CdpSession,
    site_url: &str,
    seed: &[BrowserCookie],
) -> Result<Vec<BrowserCookie>> {
    let site = Url::parse(site_url)
        .map_err(|e| AuthError::Validation(format!("Invalid siteUrl {}: {}", site_url, e)))?;
    let mut stage = Stage::Load;
    tracing::debug!(?stage, "Seeding {} cookies", seed.len());
    session.set_cookies(seed).await?;
    session.navigate(site_url).await?;

    stage = Stage::AwaitNavigation;
    tracing::debug!(?stage, "Waiting for navigation back to {}", site_url);
    loop {
        let current = session.location().await?;
        if is_on_site(&current, &site) {
            break;
        }
        tokio::time::sleep(NAVIGATION_POLL).await;
    }

    stage = Stage::HarvestCookies;
    let cookies = session.cookies().await?;
    tracing::debug!(?stage, "Harvested {} cookies", cookies.len());
    if cookies.is_empty() {
        return Err(AuthError::Protocol("Can't get authentication cookies".to_string()));
    }
    Ok(cookies)
}

/// Full interactive flow with a browser window, bounded by `timeout`
pub async fn interactive_sign_in(
    client: &reqwest::Client,
    options: &LaunchOptions,
    site_url: &str,
    seed: &[BrowserCookie],
    timeout: Duration,
) -> Result<Vec<BrowserCookie>> {
    let flow = async {
        tracing::debug!(stage = ?Stage::Launch, "Starting browser sign-in for {}", site_url);
        let browser = Browser::launch(options, &start_page(site_url)).await?;
        let result = match browser.page(client).await {
            Ok(mut session) => sign_in(&mut session, site_url, seed).await,
            Err(e) => Err(e),
        };
        tracing::debug!(stage = ?Stage::Close, "Closing browser");
        browser.close().await;
        result
    };

    // A timed out flow drops the browser, which kills the process
    tokio::time::timeout(timeout, flow).await.unwrap_or_else(|_| {
        Err(AuthError::Protocol(format!(
            "Interactive sign-in did not complete within {}s",
            timeout.as_secs()
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// DevTools stand-in answering each command from a canned table
    async fn fake_devtools(responses: Vec<(&'static str, Value)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut responses = responses.into_iter();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                // An unrelated event first, which the client must skip
                ws.send(Message::Text(json!({"method":"Page.frameNavigated"}).to_string().into()))
                    .await
                    .unwrap();
                let (method, result) = responses.next().unwrap();
                assert_eq!(request["method"], method);
                let reply = json!({ "id": request["id"], "result": result });
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();
            }
        });

        format!("ws://{}", addr)
    }

    #[test]
    fn test_chrome_args() {
        let mut extra = BTreeMap::new();
        extra.insert("proxy-server".to_string(), "http://proxy:8080".to_string());
        extra.insert("--lang".to_string(), "en".to_string());
        let args = chrome_args(Path::new("/tmp/p"), "data:x", &extra);

        assert!(args.contains(&"--remote-debugging-port=0".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/p".to_string()));
        assert!(args.contains(&"--app=data:x".to_string()));
        assert!(args.contains(&"--proxy-server=http://proxy:8080".to_string()));
        assert!(args.contains(&"--lang=en".to_string()));
    }

    #[test]
    fn test_parse_active_port() {
        assert_eq!(parse_active_port("9222\n/devtools/browser/abc\n"), Some(9222));
        assert_eq!(parse_active_port(""), None);
        assert_eq!(parse_active_port("x\n"), None);
    }

    #[test]
    fn test_start_page_is_data_url() {
        let url = start_page("https://contoso.sharepoint.com");
        let html = STANDARD
            .decode(url.strip_prefix("data:text/html;base64,").unwrap())
            .unwrap();
        assert!(String::from_utf8(html).unwrap().contains("contoso.sharepoint.com"));
    }

    #[test]
    fn test_cookie_deserialize_defaults() {
        let cookie: BrowserCookie =
            serde_json::from_str(r#"{"name":"rtFa","value":"x","size":5,"session":true}"#).unwrap();
        assert_eq!(cookie.expires, -1.0);
        assert!(cookie.set_params().get("expires").is_none());
    }

    #[test]
    fn test_is_on_site() {
        let site = Url::parse("https://contoso.sharepoint.com/sites/dev").unwrap();
        assert!(is_on_site("https://contoso.sharepoint.com/sites/dev", &site));
        assert!(is_on_site("https://CONTOSO.sharepoint.com/Sites/Dev/SitePages/Home.aspx", &site));
        assert!(!is_on_site("https://contoso.sharepoint.com/sites/devops", &site));
        assert!(!is_on_site(
            "https://login.microsoftonline.com/login.srf?wreply=https://contoso.sharepoint.com/sites/dev",
            &site
        ));
        assert!(!is_on_site("about:blank", &site));

        let root = Url::parse("https://contoso.sharepoint.com").unwrap();
        assert!(is_on_site("https://contoso.sharepoint.com/_layouts/15/start.aspx", &root));
    }

    #[tokio::test]
    async fn test_sign_in_waits_for_site_and_harvests() {
        let ws_url = fake_devtools(vec![
            ("Network.setCookie", json!({"success": true})),
            ("Page.navigate", json!({"frameId": "1"})),
            ("Runtime.evaluate", json!({"result": {"value": "https://login.microsoftonline.com/"}})),
            ("Runtime.evaluate", json!({"result": {"value": "https://login.microsoftonline.com/login.srf?wreply=https://contoso.sharepoint.com/sites/dev"}})),
            ("Runtime.evaluate", json!({"result": {"value": "https://Contoso.sharepoint.com/sites/dev/SitePages/Home.aspx"}})),
            ("Network.getCookies", json!({"cookies": [
                {"name": "FedAuth", "value": "f", "domain": "contoso.sharepoint.com", "path": "/", "expires": 4102444800.0},
                {"name": "rtFa", "value": "r", "domain": ".sharepoint.com", "path": "/", "expires": -1}
            ]})),
        ])
        .await;

        let mut session = CdpSession::connect(&ws_url).await.unwrap();
        let seed = vec![BrowserCookie {
            name: "FedAuth".to_string(),
            value: "stale".to_string(),
            domain: "contoso.sharepoint.com".to_string(),
            path: "/".to_string(),
            expires: 1.0,
            secure: true,
            http_only: true,
        }];
        let cookies = sign_in(&mut session, "https://contoso.sharepoint.com/sites/dev", &seed)
            .await
            .unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "FedAuth");
    }

    #[tokio::test]
    async fn test_closed_window_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let mut session = CdpSession::connect(&format!("ws://{}", addr)).await.unwrap();
        assert!(session.location().await.is_err());
    }
}
