//! Minimal W3C WebDriver client for a local chromedriver.

use std::{
    env, fmt, fs,
    net::TcpListener,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{blocking::Client, Method};
use serde_json::{json, Value};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::Result;

/// Key under which WebDriver serialises element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4f735466cecf";

/// WebDriver code point for the Enter key.
pub const ENTER: &str = "\u{E007}";

const STATUS_POLLS: u32 = 100;
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

const CHROME_CANDIDATES: [&str; 3] = ["google-chrome", "chromium-browser", "chromium"];
const CHROME_PATHS: [&str; 3] = [
    "/usr/bin/google-chrome",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
];

#[derive(Debug, Error)]
pub enum WebDriverError {
    #[error("{error}: {message}")]
    Protocol { error: String, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Response(String),
}

impl WebDriverError {
    pub fn protocol(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type WdResult<T> = std::result::Result<T, WebDriverError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
    Id(String),
    Name(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn xpath(path: impl Into<String>) -> Self {
        Self::XPath(path.into())
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// W3C only knows CSS, XPath, link text and tag name; id and name are
    /// lowered to attribute selectors.
    fn strategy(&self) -> (&'static str, String) {
        match self {
            Self::Css(s) => ("css selector", s.clone()),
            Self::XPath(s) => ("xpath", s.clone()),
            Self::Id(s) => ("css selector", format!("[id=\"{}\"]", s)),
            Self::Name(s) => ("css selector", format!("[name=\"{}\"]", s)),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css={}", s),
            Self::XPath(s) => write!(f, "xpath={}", s),
            Self::Id(s) => write!(f, "id={}", s),
            Self::Name(s) => write!(f, "name={}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element(String);

impl Element {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Reference form used when passing the element to a script.
    pub fn to_json(&self) -> Value {
        json!({ ELEMENT_KEY: self.0 })
    }

    fn from_json(value: &Value) -> WdResult<Self> {
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(Self::new)
            .ok_or_else(|| WebDriverError::Response(format!("not an element: {}", value)))
    }
}

/// The page operations the extraction session needs.
pub trait Browser {
    fn navigate(&mut self, url: &str) -> WdResult<()>;
    fn current_url(&mut self) -> WdResult<String>;
    fn find_all(&mut self, locator: &Locator) -> WdResult<Vec<Element>>;
    fn find_all_within(&mut self, parent: &Element, locator: &Locator) -> WdResult<Vec<Element>>;
    fn click(&mut self, element: &Element) -> WdResult<()>;
    fn clear(&mut self, element: &Element) -> WdResult<()>;
    fn send_keys(&mut self, element: &Element, text: &str) -> WdResult<()>;
    fn is_displayed(&mut self, element: &Element) -> WdResult<bool>;
    fn is_enabled(&mut self, element: &Element) -> WdResult<bool>;
    fn attribute(&mut self, element: &Element, name: &str) -> WdResult<Option<String>>;
    fn execute(&mut self, script: &str, args: Vec<Value>) -> WdResult<Value>;
    fn page_source(&mut self) -> WdResult<String>;
    fn screenshot(&mut self) -> WdResult<Vec<u8>>;

    fn find(&mut self, locator: &Locator) -> WdResult<Option<Element>> {
        Ok(self.find_all(locator)?.into_iter().next())
    }

    fn find_within(&mut self, parent: &Element, locator: &Locator) -> WdResult<Option<Element>> {
        Ok(self.find_all_within(parent, locator)?.into_iter().next())
    }
}

#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    pub chrome_binary: Option<PathBuf>,
    pub chromedriver: PathBuf,
    pub download_dir: PathBuf,
}

/// Looks for a Chrome/Chromium binary: the configured path if it exists,
/// then `$CHROME_BIN`, then the usual names on `$PATH` and install paths.
pub fn detect_chrome_binary(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit.filter(|p| p.exists()) {
        return Some(p.to_path_buf());
    }
    if let Some(p) = env::var_os("CHROME_BIN").map(PathBuf::from) {
        if p.exists() {
            return Some(p);
        }
    }
    let path_dirs: Vec<PathBuf> = env::var_os("PATH")
        .map(|p| env::split_paths(&p).collect())
        .unwrap_or_default();
    for name in CHROME_CANDIDATES {
        if let Some(found) = path_dirs.iter().map(|d| d.join(name)).find(|p| p.is_file()) {
            return Some(found);
        }
    }
    CHROME_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Kills the chromedriver child when dropped.
struct DriverProcess(Child);

impl Drop for DriverProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// A Chrome session driven through a chromedriver child process.
///
/// Dropping the session closes the browser, stops chromedriver and removes
/// the temporary profile directory, in that order.
pub struct ChromeSession {
    http: Client,
    endpoint: String,
    session_id: String,
    _process: DriverProcess,
    _profile: TempDir,
}

impl ChromeSession {
    pub fn start(options: &ChromeOptions) -> Result<Self> {
        fs::create_dir_all(&options.download_dir).with_context(|| {
            format!("failed to create {}", options.download_dir.display())
        })?;
        let profile = tempfile::Builder::new()
            .prefix("rcv_chrome_")
            .tempdir()
            .context("failed to create browser profile directory")?;

        let port = free_port()?;
        let child = Command::new(&options.chromedriver)
            .arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start {}", options.chromedriver.display()))?;
        let mut process = DriverProcess(child);

        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let endpoint = format!("http://127.0.0.1:{}", port);
        wait_until_ready(&http, &endpoint, &mut process)?;

        let capabilities = chrome_capabilities(options, profile.path());
        let response: Value = http
            .post(format!("{}/session", endpoint))
            .json(&capabilities)
            .send()?
            .json()?;
        let value = unwrap_value(response)?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .context("chromedriver did not return a session id")?
            .to_string();
        let browser_version = value
            .pointer("/capabilities/browserVersion")
            .and_then(Value::as_str)
            .unwrap_or("?");

        info!(
            "browser ready (Chrome {}, headless={}) → {}",
            browser_version,
            options.headless,
            options.download_dir.display()
        );
        Ok(Self {
            http,
            endpoint,
            session_id,
            _process: process,
            _profile: profile,
        })
    }

    fn command(&self, method: Method, path: &str, body: Option<Value>) -> WdResult<Value> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        let request = self.http.request(method.clone(), url);
        let request = match body {
            Some(body) => request.json(&body),
            None if method == Method::POST => request.json(&json!({})),
            None => request,
        };
        let response: Value = request.send()?.json()?;
        unwrap_value(response)
    }

    fn element_command(
        &self,
        method: Method,
        element: &Element,
        path: &str,
        body: Option<Value>,
    ) -> WdResult<Value> {
        self.command(method, &format!("/element/{}{}", element.id(), path), body)
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        let url = format!("{}/session/{}", self.endpoint, self.session_id);
        if let Err(e) = self.http.delete(url).send() {
            debug!("failed to close browser session: {}", e);
        }
    }
}

fn wait_until_ready(http: &Client, endpoint: &str, process: &mut DriverProcess) -> Result<()> {
    for _ in 0..STATUS_POLLS {
        if let Some(status) = process.0.try_wait()? {
            bail!("chromedriver exited early ({})", status);
        }
        let ready = http
            .get(format!("{}/status", endpoint))
            .send()
            .and_then(|r| r.json::<Value>())
            .ok()
            .and_then(|v| v.pointer("/value/ready").and_then(Value::as_bool))
            .unwrap_or(false);
        if ready {
            return Ok(());
        }
        thread::sleep(STATUS_POLL_INTERVAL);
    }
    bail!("chromedriver did not become ready")
}

fn chrome_capabilities(options: &ChromeOptions, profile: &Path) -> Value {
    let mut args: Vec<String> = Vec::new();
    if options.headless {
        args.push("--headless=new".to_string());
    }
    args.extend(
        [
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            "--disable-extensions",
            "--window-size=1920,1080",
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-sync",
        ]
        .map(String::from),
    );
    args.push(format!("--user-data-dir={}", profile.display()));

    let mut chrome = json!({
        "args": args,
        "prefs": {
            "download.default_directory": options.download_dir.display().to_string(),
            "download.prompt_for_download": false,
            "download.directory_upgrade": true,
            "safebrowsing.enabled": true,
            "plugins.always_open_pdf_externally": true,
        },
    });
    if let Some(binary) = detect_chrome_binary(options.chrome_binary.as_deref()) {
        chrome["binary"] = json!(binary.display().to_string());
    }
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": chrome,
            }
        }
    })
}

/// Extracts `value` from a WebDriver response, turning error payloads into
/// `WebDriverError::Protocol`.
fn unwrap_value(mut response: Value) -> WdResult<Value> {
    let value = response
        .get_mut("value")
        .map(Value::take)
        .ok_or_else(|| WebDriverError::Response(response.to_string()))?;
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(WebDriverError::protocol(error, message));
    }
    Ok(value)
}

fn elements_from(value: Value) -> WdResult<Vec<Element>> {
    value
        .as_array()
        .ok_or_else(|| WebDriverError::Response(format!("expected a list: {}", value)))?
        .iter()
        .map(Element::from_json)
        .collect()
}

fn as_bool(value: Value) -> WdResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| WebDriverError::Response(format!("expected a boolean: {}", value)))
}

fn as_string(value: Value) -> WdResult<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(WebDriverError::Response(format!("expected a string: {}", other))),
    }
}

fn find_body(locator: &Locator) -> Value {
    let (using, value) = locator.strategy();
    json!({ "using": using, "value": value })
}

impl Browser for ChromeSession {
    fn navigate(&mut self, url: &str) -> WdResult<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))?;
        Ok(())
    }

    fn current_url(&mut self) -> WdResult<String> {
        as_string(self.command(Method::GET, "/url", None)?)
    }

    fn find_all(&mut self, locator: &Locator) -> WdResult<Vec<Element>> {
        elements_from(self.command(Method::POST, "/elements", Some(find_body(locator)))?)
    }

    fn find_all_within(&mut self, parent: &Element, locator: &Locator) -> WdResult<Vec<Element>> {
        elements_from(self.element_command(
            Method::POST,
            parent,
            "/elements",
            Some(find_body(locator)),
        )?)
    }

    fn click(&mut self, element: &Element) -> WdResult<()> {
        self.element_command(Method::POST, element, "/click", None)?;
        Ok(())
    }

    fn clear(&mut self, element: &Element) -> WdResult<()> {
        self.element_command(Method::POST, element, "/clear", None)?;
        Ok(())
    }

    fn send_keys(&mut self, element: &Element, text: &str) -> WdResult<()> {
        self.element_command(Method::POST, element, "/value", Some(json!({ "text": text })))?;
        Ok(())
    }

    fn is_displayed(&mut self, element: &Element) -> WdResult<bool> {
        as_bool(self.element_command(Method::GET, element, "/displayed", None)?)
    }

    fn is_enabled(&mut self, element: &Element) -> WdResult<bool> {
        as_bool(self.element_command(Method::GET, element, "/enabled", None)?)
    }

    fn attribute(&mut self, element: &Element, name: &str) -> WdResult<Option<String>> {
        let value =
            self.element_command(Method::GET, element, &format!("/attribute/{}", name), None)?;
        Ok(value.as_str().map(str::to_string))
    }

    fn execute(&mut self, script: &str, args: Vec<Value>) -> WdResult<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
    }

    fn page_source(&mut self) -> WdResult<String> {
        as_string(self.command(Method::GET, "/source", None)?)
    }

    fn screenshot(&mut self) -> WdResult<Vec<u8>> {
        let encoded = as_string(self.command(Method::GET, "/screenshot", None)?)?;
        STANDARD
            .decode(encoded)
            .map_err(|e| WebDriverError::Response(format!("bad screenshot encoding: {}", e)))
    }
}
