//! Browser automation
//!
//! `Browser` is the narrow surface the chat session drives. `ChromeBrowser`
//! implements it with thirtyfour against a chromedriver child process, running
//! each WebDriver call to completion on a private single-threaded runtime.

use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thirtyfour::prelude::*;
use thirtyfour::{ChromeCapabilities, ChromiumLikeCapabilities};
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Enter key codepoint
pub const KEY_ENTER: char = '\u{E007}';
/// Shift modifier codepoint
pub const KEY_SHIFT: char = '\u{E008}';
/// Releases held modifiers
pub const KEY_NULL: char = '\u{E000}';

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// How to find an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator<'a> {
    Css(&'a str),
    XPath(&'a str),
}

impl fmt::Display for Locator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(css) => write!(f, "css selector={}", css),
            Locator::XPath(xpath) => write!(f, "xpath={}", xpath),
        }
    }
}

/// What the chat session needs from a browser
pub trait Browser {
    type Element: Clone;

    fn navigate(&mut self, url: &str) -> Result<()>;

    fn find_all(&mut self, locator: Locator<'_>) -> Result<Vec<Self::Element>>;

    /// Run a script; `element` becomes `arguments[0]` and `args` follow it
    fn execute(&mut self, script: &str, element: Option<&Self::Element>, args: Vec<Value>) -> Result<Value>;

    fn send_keys(&mut self, element: &Self::Element, keys: &str) -> Result<()>;

    fn click(&mut self, element: &Self::Element) -> Result<()>;

    fn inner_text(&mut self, element: &Self::Element) -> Result<Option<String>>;

    fn quit(&mut self) -> Result<()>;
}

/// Poll until `locator` matches or `timeout` passes; session loss is returned as an error
pub fn wait_for_element<B: Browser + ?Sized>(
    browser: &mut B,
    locator: Locator<'_>,
    timeout: Duration,
    poll: Duration,
) -> Result<Option<B::Element>> {
    let deadline = Instant::now() + timeout;
    loop {
        match browser.find_all(locator) {
            Ok(found) => {
                if let Some(el) = found.into_iter().next() {
                    return Ok(Some(el));
                }
            }
            Err(e) if e.is_session_lost() => return Err(e),
            Err(e) => debug!("transient lookup error for {}: {}", locator, e),
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(poll);
    }
}

/// Chrome launch settings
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub profile_dir: PathBuf,
    pub headless: bool,
    pub binary: Option<PathBuf>,
}

/// Command-line switches that keep the page from seeing an automated browser
pub fn chrome_args(opts: &ChromeOptions) -> Vec<String> {
    let mut args = vec![
        "--disable-blink-features=AutomationControlled".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        format!("--user-agent={}", USER_AGENT),
        format!("--user-data-dir={}", opts.profile_dir.display()),
    ];
    if opts.headless {
        args.push("--headless=new".to_string());
        args.push("--disable-gpu".to_string());
    }
    args
}

fn chrome_capabilities(opts: &ChromeOptions) -> Result<ChromeCapabilities> {
    let mut caps = DesiredCapabilities::chrome();
    for arg in chrome_args(opts) {
        caps.add_arg(&arg)?;
    }
    caps.add_exclude_switch("enable-automation")?;
    caps.add_experimental_option("useAutomationExtension", false)?;
    if let Some(binary) = &opts.binary {
        caps.set_binary(&binary.display().to_string())?;
    }
    Ok(caps)
}

/// Chrome controlled through a running chromedriver
pub struct ChromeBrowser {
    runtime: Runtime,
    driver: Option<WebDriver>,
}

impl ChromeBrowser {
    /// Open a browser session on the chromedriver at `server_url`
    pub fn connect(server_url: &str, opts: &ChromeOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let caps = chrome_capabilities(opts)?;
        let driver = runtime.block_on(WebDriver::new(server_url, caps))?;
        debug!("webdriver session created");

        Ok(Self {
            runtime,
            driver: Some(driver),
        })
    }

    fn driver(&self) -> Result<&WebDriver> {
        self.driver
            .as_ref()
            .ok_or_else(|| Error::webdriver("invalid session id", "browser session already closed"))
    }
}

impl Browser for ChromeBrowser {
    type Element = WebElement;

    fn navigate(&mut self, url: &str) -> Result<()> {
        let driver = self.driver()?;
        self.runtime.block_on(driver.goto(url))?;
        Ok(())
    }

    fn find_all(&mut self, locator: Locator<'_>) -> Result<Vec<WebElement>> {
        let driver = self.driver()?;
        let found = match locator {
            Locator::Css(css) => self.runtime.block_on(driver.find_all(By::Css(css)))?,
            Locator::XPath(xpath) => self.runtime.block_on(driver.find_all(By::XPath(xpath)))?,
        };
        Ok(found)
    }

    fn execute(&mut self, script: &str, element: Option<&WebElement>, args: Vec<Value>) -> Result<Value> {
        let driver = self.driver()?;
        let mut all = Vec::with_capacity(args.len() + 1);
        if let Some(el) = element {
            all.push(el.to_json()?);
        }
        all.extend(args);
        let ret = self.runtime.block_on(driver.execute(script, all))?;
        Ok(ret.json().clone())
    }

    fn send_keys(&mut self, element: &WebElement, keys: &str) -> Result<()> {
        self.runtime.block_on(element.send_keys(keys))?;
        Ok(())
    }

    fn click(&mut self, element: &WebElement) -> Result<()> {
        self.runtime.block_on(element.click())?;
        Ok(())
    }

    fn inner_text(&mut self, element: &WebElement) -> Result<Option<String>> {
        Ok(self.runtime.block_on(element.prop("innerText"))?)
    }

    fn quit(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            self.runtime.block_on(driver.quit())?;
        }
        Ok(())
    }
}

impl Drop for ChromeBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.quit() {
            debug!("browser quit on drop failed: {}", e);
        }
    }
}

/// Find chromedriver: explicit path first, then `PATH`
pub fn locate_chromedriver(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    which::which("chromedriver").ok()
}

/// Find a Chrome/Chromium binary the driver can launch
pub fn locate_chrome(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium-browser",
            "chromium",
            "/opt/google/chrome/chrome",
            "/app/.chrome-for-testing/chrome-linux64/chrome",
        ]
    };

    for candidate in candidates {
        let path = Path::new(candidate);
        if path.is_absolute() {
            if path.exists() {
                return Some(path.to_path_buf());
            }
        } else if let Ok(found) = which::which(candidate) {
            return Some(found);
        }
    }
    None
}

/// A running chromedriver process
pub struct DriverProcess {
    child: Child,
    port: u16,
}

impl DriverProcess {
    /// Start chromedriver on a free local port and wait until it reports ready
    pub fn spawn(binary: &Path, startup_timeout: Duration) -> Result<Self> {
        let port = free_port()?;
        let child = Command::new(binary)
            .arg(format!("--port={}", port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::SessionInit(format!("failed to launch {}: {}", binary.display(), e)))?;

        let mut process = Self { child, port };
        process.wait_ready(startup_timeout)?;
        info!("chromedriver listening on port {}", port);
        Ok(process)
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()?;
        let status_url = format!("{}/status", self.url());
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(Error::SessionInit(format!(
                    "chromedriver exited during startup ({})",
                    status
                )));
            }
            if let Ok(resp) = client.get(&status_url).send() {
                if let Ok(body) = resp.json::<Value>() {
                    if body["value"]["ready"].as_bool().unwrap_or(false) {
                        return Ok(());
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(200));
        }

        self.kill();
        Err(Error::SessionInit(format!(
            "chromedriver not ready on port {} after {}s",
            self.port,
            timeout.as_secs()
        )))
    }

    pub fn kill(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// XPath string literal for arbitrary text (handles embedded quotes)
pub fn xpath_literal(text: &str) -> String {
    if !text.contains('"') {
        return format!("\"{}\"", text);
    }
    if !text.contains('\'') {
        return format!("'{}'", text);
    }
    let parts: Vec<String> = text.split('"').map(|p| format!("\"{}\"", p)).collect();
    format!("concat({})", parts.join(", '\"', "))
}
