//! Chat session management
//!
//! `ChatSession` is the capability the delivery engine and the remote runner
//! drive. `WebChatSession` implements it against WhatsApp Web through a
//! chromedriver-controlled Chrome with a persistent profile directory. The
//! page-level steps are written against the `Browser` trait.

use crate::browser::{
    locate_chrome, locate_chromedriver, wait_for_element, xpath_literal, Browser, ChromeBrowser, ChromeOptions,
    DriverProcess, Locator, KEY_ENTER, KEY_NULL, KEY_SHIFT,
};
use crate::config::{BotConfig, Timeouts};
use crate::error::{Error, Result};
use crate::pacing::Pacing;
use crate::strategy::{first_success, ChainFailure};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    AwaitingLogin,
    LoggedIn,
    ChatOpen,
    Composing,
    Verifying,
    Closed,
}

impl SessionState {
    pub fn is_logged_in(&self) -> bool {
        matches!(
            self,
            SessionState::LoggedIn | SessionState::ChatOpen | SessionState::Composing | SessionState::Verifying
        )
    }
}

/// What a delivery pipeline needs from a chat client
pub trait ChatSession {
    /// Start the browser. No-op when already running.
    fn initialize(&mut self) -> Result<()>;

    /// Wait for a logged-in client. `Ok(false)` on timeout.
    fn await_login(&mut self, timeout: Duration) -> Result<bool>;

    fn is_logged_in(&self) -> bool;

    /// Open the conversation for a normalized phone number. `Ok(false)` if it never loads.
    fn open_conversation(&mut self, phone: &str) -> Result<bool>;

    /// Put `text` in the compose box of the open conversation and submit it
    fn insert_and_send(&mut self, text: &str) -> Result<()>;

    /// Whether `snippet` shows up in the open conversation within `timeout`
    fn verify_delivery(&mut self, snippet: &str, timeout: Duration) -> Result<bool>;

    /// Close the browser. Safe to call repeatedly.
    fn shutdown(&mut self);
}

/// Start the session if needed and wait for login; a timeout is `LoginTimeout`
pub fn ensure_logged_in<S: ChatSession + ?Sized>(session: &mut S, timeout: Duration) -> Result<()> {
    if session.is_logged_in() {
        return Ok(());
    }

    let logged_in = session
        .initialize()
        .and_then(|_| session.await_login(timeout))
        .map_err(|e| if e.is_run_fatal() { e } else { Error::SessionInit(e.to_string()) })?;

    if logged_in {
        Ok(())
    } else {
        Err(Error::LoginTimeout(timeout.as_secs()))
    }
}

const LOGGED_IN_MARKERS: [&str; 4] = [
    r#"[data-testid="chat-list"]"#,
    r#"[data-testid="conversation-panel-messages"]"#,
    "#pane-side",
    r#"div[role="textbox"][contenteditable="true"]"#,
];

const QR_MARKERS: [&str; 2] = [r#"canvas[aria-label="Scan me!"]"#, "div[data-ref] canvas"];

const COMPOSE_BOX: [Locator<'static>; 3] = [
    Locator::Css(r#"[data-testid="conversation-compose-box-input"]"#),
    Locator::Css(r#"#main div[contenteditable="true"]"#),
    Locator::XPath(r#"//*[@id="main"]//footer//div[@contenteditable="true"]"#),
];

const SEND_BUTTONS: [Locator<'static>; 3] = [
    Locator::Css(r#"button[data-testid="compose-btn-send"]"#),
    Locator::Css(r#"button[aria-label="Send"]"#),
    Locator::Css(r#"span[data-icon="send"]"#),
];

const LOGIN_PROGRESS_EVERY: Duration = Duration::from_secs(15);
const ELEMENT_POLL: Duration = Duration::from_millis(500);

const HIDE_WEBDRIVER_JS: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined }); return true;";

const MAIN_TEXT_JS: &str = "const m = document.querySelector('#main'); return m ? m.innerText : '';";

const EXEC_COMMAND_JS: &str = r#"
const el = arguments[0];
el.focus();
document.execCommand('selectAll', false, null);
return document.execCommand('insertText', false, arguments[1]);
"#;

const INNER_HTML_JS: &str = r#"
const el = arguments[0];
el.focus();
el.innerHTML = arguments[1];
el.dispatchEvent(new InputEvent('input', { bubbles: true }));
return true;
"#;

const TEXT_CONTENT_JS: &str = r#"
const el = arguments[0];
el.focus();
el.textContent = arguments[1];
el.dispatchEvent(new InputEvent('input', { bubbles: true }));
return true;
"#;

/// Ways of getting text into the compose box, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertStrategy {
    Keystrokes,
    ExecCommand,
    InnerHtml,
    TextContent,
}

impl fmt::Display for InsertStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InsertStrategy::Keystrokes => "keystrokes",
            InsertStrategy::ExecCommand => "execCommand",
            InsertStrategy::InnerHtml => "innerHTML",
            InsertStrategy::TextContent => "textContent",
        };
        write!(f, "{}", label)
    }
}

const INSERT_STRATEGIES: [InsertStrategy; 4] = [
    InsertStrategy::Keystrokes,
    InsertStrategy::ExecCommand,
    InsertStrategy::InnerHtml,
    InsertStrategy::TextContent,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginScreen {
    LoggedIn,
    QrCode,
    Loading,
}

/// WhatsApp Web driven through chromedriver
pub struct WebChatSession {
    base_url: String,
    profile_dir: PathBuf,
    headless: bool,
    chromedriver: Option<PathBuf>,
    chrome_binary: Option<PathBuf>,
    timeouts: Timeouts,
    pacing: Pacing,
    state: SessionState,
    browser: Option<ChromeBrowser>,
    process: Option<DriverProcess>,
}

fn running<B>(browser: &mut Option<B>) -> Result<&mut B> {
    browser
        .as_mut()
        .ok_or_else(|| Error::SessionInit("browser session is not running".to_string()))
}

impl WebChatSession {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            base_url: config.chat_base_url.trim_end_matches('/').to_string(),
            profile_dir: config.profile_dir.clone(),
            headless: config.headless,
            chromedriver: config.chromedriver.clone(),
            chrome_binary: config.chrome_binary.clone(),
            timeouts: config.timeouts.clone(),
            pacing: config.pacing.clone(),
            state: SessionState::Uninitialized,
            browser: None,
            process: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn start_browser(&self) -> Result<(DriverProcess, ChromeBrowser)> {
        std::fs::create_dir_all(&self.profile_dir).map_err(|e| {
            Error::SessionInit(format!("cannot create profile dir {}: {}", self.profile_dir.display(), e))
        })?;

        let binary = locate_chromedriver(self.chromedriver.as_deref()).ok_or_else(|| {
            Error::SessionInit(match &self.chromedriver {
                Some(path) => format!("chromedriver not found at {}", path.display()),
                None => "chromedriver not found on PATH (set CHROMEDRIVER_PATH)".to_string(),
            })
        })?;

        let process = DriverProcess::spawn(&binary, self.timeouts.driver_start)?;
        let options = ChromeOptions {
            profile_dir: self.profile_dir.clone(),
            headless: self.headless,
            binary: self
                .chrome_binary
                .clone()
                .or_else(|| locate_chrome(None)),
        };
        let mut browser = ChromeBrowser::connect(&process.url(), &options)
            .map_err(|e| Error::SessionInit(format!("browser did not start: {}", e)))?;

        if let Err(e) = browser.execute(HIDE_WEBDRIVER_JS, None, vec![]) {
            debug!("could not hide navigator.webdriver: {}", e);
        }

        Ok((process, browser))
    }

    /// Drop the browser after it went away underneath us
    fn mark_lost(&mut self) {
        warn!("browser session lost, closing");
        self.browser = None;
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        self.state = SessionState::Closed;
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_session_lost() {
                self.mark_lost();
            }
        }
        result
    }
}

impl ChatSession for WebChatSession {
    fn initialize(&mut self) -> Result<()> {
        if self.browser.is_some() {
            return Ok(());
        }

        self.state = SessionState::Initializing;
        info!(profile = %self.profile_dir.display(), headless = self.headless, "starting browser session");

        match self.start_browser() {
            Ok((process, browser)) => {
                self.process = Some(process);
                self.browser = Some(browser);
                self.state = SessionState::AwaitingLogin;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    fn await_login(&mut self, timeout: Duration) -> Result<bool> {
        self.initialize()?;
        self.state = SessionState::AwaitingLogin;

        let nav = running(&mut self.browser)?.navigate(&self.base_url);
        if let Err(e) = self.track(nav) {
            if e.is_session_lost() {
                return Err(e);
            }
            warn!("could not load {}: {}", self.base_url, e);
        }

        let start = Instant::now();
        let mut last_progress = start;
        let mut qr_visible = false;

        loop {
            let screen = check_login(running(&mut self.browser)?);
            match self.track(screen) {
                Ok(LoginScreen::LoggedIn) => {
                    info!("chat client logged in after {}s", start.elapsed().as_secs());
                    self.state = SessionState::LoggedIn;
                    return Ok(true);
                }
                Ok(LoginScreen::QrCode) => {
                    if !qr_visible {
                        info!("QR code shown: open WhatsApp on the phone, Linked devices, and scan it");
                    }
                    qr_visible = true;
                }
                Ok(LoginScreen::Loading) => qr_visible = false,
                Err(e) if e.is_session_lost() => return Err(e),
                Err(e) => debug!("login check failed: {}", e),
            }

            if start.elapsed() >= timeout {
                warn!("no login detected within {}s", timeout.as_secs());
                return Ok(false);
            }
            if last_progress.elapsed() >= LOGIN_PROGRESS_EVERY {
                info!(
                    "still waiting for login ({}s of {}s)",
                    start.elapsed().as_secs(),
                    timeout.as_secs()
                );
                last_progress = Instant::now();
            }
            std::thread::sleep(self.timeouts.login_poll);
        }
    }

    fn is_logged_in(&self) -> bool {
        self.browser.is_some() && self.state.is_logged_in()
    }

    fn open_conversation(&mut self, phone: &str) -> Result<bool> {
        let url = conversation_url(&self.base_url, phone);
        debug!("opening {}", url);

        let timeout = self.timeouts.open_chat;
        let browser = running(&mut self.browser)?;
        let result = browser
            .navigate(&url)
            .and_then(|_| wait_for_element(browser, Locator::Css("#main"), timeout, ELEMENT_POLL));

        match self.track(result) {
            Ok(Some(_)) => {
                self.state = SessionState::ChatOpen;
                Ok(true)
            }
            Ok(None) => {
                warn!("conversation for {} did not load within {}s", phone, timeout.as_secs());
                self.state = SessionState::LoggedIn;
                Ok(false)
            }
            Err(e) if e.is_session_lost() => Err(e),
            Err(e) => {
                warn!("could not open conversation for {}: {}", phone, e);
                self.state = SessionState::LoggedIn;
                Ok(false)
            }
        }
    }

    fn insert_and_send(&mut self, text: &str) -> Result<()> {
        self.state = SessionState::Composing;
        let pacing = &self.pacing;
        let timeouts = &self.timeouts;
        let browser = running(&mut self.browser)?;

        let result = locate_compose_box(browser, timeouts.compose_box).and_then(|found| {
            let compose = found.ok_or_else(|| Error::ComposeInsert("compose box not found".to_string()))?;
            let strategy = insert_text(browser, &compose, text, pacing)?;
            debug!("text inserted via {}", strategy);
            submit_message(browser, &compose, text, pacing, timeouts.send_button)
        });

        let result = self.track(result);
        if self.state != SessionState::Closed {
            self.state = SessionState::ChatOpen;
        }
        result
    }

    fn verify_delivery(&mut self, snippet: &str, timeout: Duration) -> Result<bool> {
        self.state = SessionState::Verifying;
        let poll = self.timeouts.verify_poll;
        let result = poll_for_snippet(running(&mut self.browser)?, snippet, timeout, poll);
        let result = self.track(result);
        if self.state != SessionState::Closed {
            self.state = SessionState::LoggedIn;
        }
        result
    }

    fn shutdown(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.quit() {
                debug!("webdriver quit failed: {}", e);
            }
        }
        if let Some(mut process) = self.process.take() {
            process.kill();
            info!("browser session closed");
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for WebChatSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_login<B: Browser + ?Sized>(browser: &mut B) -> Result<LoginScreen> {
    for marker in LOGGED_IN_MARKERS {
        if !browser.find_all(Locator::Css(marker))?.is_empty() {
            return Ok(LoginScreen::LoggedIn);
        }
    }
    for marker in QR_MARKERS {
        if !browser.find_all(Locator::Css(marker))?.is_empty() {
            return Ok(LoginScreen::QrCode);
        }
    }
    Ok(LoginScreen::Loading)
}

/// Deep link that opens a chat with an arbitrary number
pub fn conversation_url(base_url: &str, phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    format!(
        "{}/send?phone={}&type=phone_number&app_absent=0",
        base_url.trim_end_matches('/'),
        digits
    )
}

fn chain_error(failure: ChainFailure, wrap: fn(String) -> Error) -> Error {
    if failure.session_lost {
        Error::webdriver("invalid session id", failure.to_string())
    } else {
        wrap(failure.to_string())
    }
}

fn locate_compose_box<B: Browser + ?Sized>(browser: &mut B, timeout: Duration) -> Result<Option<B::Element>> {
    let found = first_success(&COMPOSE_BOX, |locator| {
        wait_for_element(browser, *locator, timeout, ELEMENT_POLL)?
            .ok_or_else(|| Error::ComposeInsert(format!("{} not found", locator)))
    });

    match found {
        Ok((idx, element)) => {
            debug!("compose box matched {}", COMPOSE_BOX[idx]);
            Ok(Some(element))
        }
        Err(failure) if failure.session_lost => Err(chain_error(failure, Error::ComposeInsert)),
        Err(failure) => {
            debug!("compose box lookup failed: {}", failure);
            Ok(None)
        }
    }
}

fn insert_text<B: Browser + ?Sized>(
    browser: &mut B,
    compose: &B::Element,
    text: &str,
    pacing: &Pacing,
) -> Result<InsertStrategy> {
    let result = first_success(&INSERT_STRATEGIES, |strategy| match strategy {
        InsertStrategy::Keystrokes => {
            if !is_bmp(text) {
                return Err(Error::ComposeInsert(
                    "text has characters outside the Basic Multilingual Plane".to_string(),
                ));
            }
            browser.click(compose)?;
            for keys in keystrokes(text) {
                browser.send_keys(compose, &keys)?;
                pacing.keystroke.pause();
            }
            Ok(())
        }
        InsertStrategy::ExecCommand => {
            let inserted = browser.execute(EXEC_COMMAND_JS, Some(compose), vec![Value::from(text)])?;
            if inserted.as_bool().unwrap_or(false) {
                Ok(())
            } else {
                Err(Error::ComposeInsert("execCommand insertText returned false".to_string()))
            }
        }
        InsertStrategy::InnerHtml => {
            browser.execute(INNER_HTML_JS, Some(compose), vec![Value::from(text_to_html(text))])?;
            Ok(())
        }
        InsertStrategy::TextContent => {
            browser.execute(TEXT_CONTENT_JS, Some(compose), vec![Value::from(text)])?;
            Ok(())
        }
    });

    match result {
        Ok((idx, ())) => Ok(INSERT_STRATEGIES[idx]),
        Err(failure) => Err(chain_error(failure, Error::ComposeInsert)),
    }
}

fn submit_message<B: Browser + ?Sized>(
    browser: &mut B,
    compose: &B::Element,
    text: &str,
    pacing: &Pacing,
    button_timeout: Duration,
) -> Result<()> {
    pacing.before_submit.pause();

    let enter = browser
        .click(compose)
        .and_then(|_| browser.send_keys(compose, &KEY_ENTER.to_string()));
    match enter {
        Ok(()) => {
            pacing.after_submit.pause();
            // The compose element is replaced after a send; a stale handle counts as sent
            let current = browser.inner_text(compose).unwrap_or(None).unwrap_or_default();
            if !still_holds(&current, text) {
                return Ok(());
            }
            debug!("Enter left the text in the compose box, trying the send button");
        }
        Err(e) if e.is_session_lost() => return Err(e),
        Err(e) => debug!("Enter keystroke failed: {}", e),
    }

    let clicked = first_success(&SEND_BUTTONS, |locator| {
        let button = wait_for_element(browser, *locator, button_timeout, ELEMENT_POLL)?
            .ok_or_else(|| Error::SendFailed(format!("{} not found", locator)))?;
        browser.click(&button)
    });

    match clicked {
        Ok((idx, ())) => {
            debug!("sent via {}", SEND_BUTTONS[idx]);
            pacing.after_submit.pause();
            Ok(())
        }
        Err(failure) => Err(chain_error(failure, Error::SendFailed)),
    }
}

/// XPath that matches an element in the open conversation whose own text holds `snippet`
fn snippet_xpath(snippet: &str) -> String {
    format!("//*[@id='main']//*[contains(text(), {})]", xpath_literal(snippet))
}

fn poll_for_snippet<B: Browser + ?Sized>(
    browser: &mut B,
    snippet: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        match browser.execute(MAIN_TEXT_JS, None, vec![]) {
            Ok(text) => {
                if text.as_str().is_some_and(|t| t.contains(snippet)) {
                    return Ok(true);
                }
            }
            Err(e) if e.is_session_lost() => return Err(e),
            Err(e) => debug!("panel text read failed: {}", e),
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(poll);
    }

    let xpath = snippet_xpath(snippet);
    Ok(wait_for_element(browser, Locator::XPath(&xpath), timeout, poll)?.is_some())
}

/// ChromeDriver rejects keystrokes outside the BMP (most emoji)
fn is_bmp(text: &str) -> bool {
    text.chars().all(|c| (c as u32) <= 0xFFFF)
}

/// One key sequence per character; newlines become Shift+Enter so they don't submit
fn keystrokes(text: &str) -> Vec<String> {
    text.chars()
        .filter(|c| *c != '\r')
        .map(|c| match c {
            '\n' => format!("{}{}{}", KEY_SHIFT, KEY_ENTER, KEY_NULL),
            other => other.to_string(),
        })
        .collect()
}

fn text_to_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace("\r\n", "\n")
        .replace('\n', "<br>")
}

fn still_holds(current: &str, text: &str) -> bool {
    let current = current.trim();
    if current.is_empty() {
        return false;
    }
    match text.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => current.contains(line),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    const COMPOSE: &str = "compose";

    /// Page double: elements are the locator strings that currently match
    #[derive(Default)]
    struct ScriptedBrowser {
        present: Vec<String>,
        reject_non_bmp: bool,
        keys_fail: bool,
        exec_command_works: bool,
        /// Panel text per read; the last entry repeats
        panel: VecDeque<String>,
        panel_reads: usize,
        enter_submits: bool,
        compose_text: String,
        calls: Vec<String>,
    }

    fn locator_value(locator: Locator<'_>) -> String {
        match locator {
            Locator::Css(v) | Locator::XPath(v) => v.to_string(),
        }
    }

    impl Browser for ScriptedBrowser {
        type Element = String;

        fn navigate(&mut self, url: &str) -> Result<()> {
            self.calls.push(format!("navigate {}", url));
            Ok(())
        }

        fn find_all(&mut self, locator: Locator<'_>) -> Result<Vec<String>> {
            self.calls.push(format!("find {}", locator));
            let value = locator_value(locator);
            Ok(self.present.iter().filter(|p| **p == value).cloned().collect())
        }

        fn execute(&mut self, script: &str, _element: Option<&String>, args: Vec<Value>) -> Result<Value> {
            if script == MAIN_TEXT_JS {
                self.panel_reads += 1;
                let text = if self.panel.len() > 1 {
                    self.panel.pop_front().unwrap_or_default()
                } else {
                    self.panel.front().cloned().unwrap_or_default()
                };
                return Ok(Value::from(text));
            }

            let label = match script {
                EXEC_COMMAND_JS => "execCommand",
                INNER_HTML_JS => "innerHTML",
                TEXT_CONTENT_JS => "textContent",
                _ => "script",
            };
            self.calls.push(format!("execute {}", label));
            if script == EXEC_COMMAND_JS && !self.exec_command_works {
                return Ok(Value::Bool(false));
            }
            if let Some(text) = args.first().and_then(Value::as_str) {
                self.compose_text = text.to_string();
            }
            Ok(Value::Bool(true))
        }

        fn send_keys(&mut self, _element: &String, keys: &str) -> Result<()> {
            if keys == KEY_ENTER.to_string() {
                self.calls.push("enter".to_string());
                if self.enter_submits {
                    self.compose_text.clear();
                }
                return Ok(());
            }
            if self.keys_fail || (self.reject_non_bmp && !is_bmp(keys)) {
                self.calls.push("keys rejected".to_string());
                return Err(Error::webdriver("webdriver", "ChromeDriver only supports characters in the BMP"));
            }
            if self.calls.last().map(String::as_str) != Some("keys") {
                self.calls.push("keys".to_string());
            }
            self.compose_text.push_str(keys);
            Ok(())
        }

        fn click(&mut self, element: &String) -> Result<()> {
            self.calls.push(format!("click {}", element));
            if SEND_BUTTONS.iter().any(|b| locator_value(*b) == *element) {
                self.compose_text.clear();
            }
            Ok(())
        }

        fn inner_text(&mut self, _element: &String) -> Result<Option<String>> {
            Ok(Some(self.compose_text.clone()))
        }

        fn quit(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn compose() -> String {
        COMPOSE.to_string()
    }

    fn executed(browser: &ScriptedBrowser) -> Vec<&str> {
        browser
            .calls
            .iter()
            .filter_map(|c| c.strip_prefix("execute "))
            .collect()
    }

    #[test]
    fn test_insert_prefers_keystrokes() {
        let mut browser = ScriptedBrowser::default();
        let strategy = insert_text(&mut browser, &compose(), "Hi Dana", &Pacing::none()).unwrap();
        assert_eq!(strategy, InsertStrategy::Keystrokes);
        assert_eq!(browser.compose_text, "Hi Dana");
        assert!(executed(&browser).is_empty());
    }

    #[test]
    fn test_emoji_text_goes_straight_to_exec_command() {
        let mut browser = ScriptedBrowser {
            reject_non_bmp: true,
            exec_command_works: true,
            ..Default::default()
        };
        let strategy = insert_text(&mut browser, &compose(), "Mazal tov 🎉", &Pacing::none()).unwrap();
        assert_eq!(strategy, InsertStrategy::ExecCommand);
        assert_eq!(browser.calls, vec!["execute execCommand"]);
        assert_eq!(browser.compose_text, "Mazal tov 🎉");
    }

    #[test]
    fn test_rejected_keystrokes_fall_back_to_exec_command() {
        let mut browser = ScriptedBrowser {
            keys_fail: true,
            exec_command_works: true,
            ..Default::default()
        };
        let strategy = insert_text(&mut browser, &compose(), "Hi Dana", &Pacing::none()).unwrap();
        assert_eq!(strategy, InsertStrategy::ExecCommand);
        assert_eq!(browser.calls, vec!["click compose", "keys rejected", "execute execCommand"]);
    }

    #[test]
    fn test_insert_strategy_order() {
        let mut browser = ScriptedBrowser {
            keys_fail: true,
            exec_command_works: false,
            ..Default::default()
        };
        let strategy = insert_text(&mut browser, &compose(), "a < b\nc", &Pacing::none()).unwrap();
        assert_eq!(strategy, InsertStrategy::InnerHtml);
        assert_eq!(executed(&browser), vec!["execCommand", "innerHTML"]);
        assert_eq!(browser.compose_text, "a &lt; b<br>c");
    }

    #[test]
    fn test_enter_submits_without_button() {
        let mut browser = ScriptedBrowser {
            enter_submits: true,
            compose_text: "Hi Dana".to_string(),
            present: vec![locator_value(SEND_BUTTONS[0])],
            ..Default::default()
        };
        submit_message(&mut browser, &compose(), "Hi Dana", &Pacing::none(), Duration::ZERO).unwrap();
        assert_eq!(browser.calls, vec!["click compose", "enter"]);
    }

    #[test]
    fn test_text_left_after_enter_clicks_send_button() {
        let mut browser = ScriptedBrowser {
            compose_text: "Hi Dana\nsee you".to_string(),
            present: vec![locator_value(SEND_BUTTONS[1])],
            ..Default::default()
        };
        submit_message(&mut browser, &compose(), "Hi Dana\nsee you", &Pacing::none(), Duration::ZERO).unwrap();

        let send = format!("click {}", locator_value(SEND_BUTTONS[1]));
        assert_eq!(browser.calls.last(), Some(&send));
        assert!(browser.calls.contains(&"enter".to_string()));
        assert!(browser.compose_text.is_empty());
    }

    #[test]
    fn test_no_send_button_is_send_failed() {
        let mut browser = ScriptedBrowser {
            compose_text: "Hi Dana".to_string(),
            ..Default::default()
        };
        let err = submit_message(&mut browser, &compose(), "Hi Dana", &Pacing::none(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
        assert!(!err.is_session_lost());
    }

    #[test]
    fn test_snippet_found_on_third_read() {
        let mut browser = ScriptedBrowser {
            panel: VecDeque::from(vec![
                String::new(),
                "Dana\nloading".to_string(),
                "Dana\nhttps://wedding.example.com/rsvp/abc-123\n10:42".to_string(),
            ]),
            ..Default::default()
        };
        let found = poll_for_snippet(&mut browser, "/rsvp/abc-123", Duration::from_secs(5), Duration::ZERO).unwrap();
        assert!(found);
        assert_eq!(browser.panel_reads, 3);
        assert!(!browser.calls.iter().any(|c| c.starts_with("find xpath")));
    }

    #[test]
    fn test_snippet_missing_tries_xpath_then_gives_up() {
        let mut browser = ScriptedBrowser {
            panel: VecDeque::from(vec!["Dana\nHi".to_string()]),
            ..Default::default()
        };
        let timeout = Duration::from_millis(20);
        let start = Instant::now();
        let found = poll_for_snippet(&mut browser, "/rsvp/abc-123", timeout, Duration::from_millis(2)).unwrap();

        assert!(!found);
        assert!(start.elapsed() >= timeout * 2);
        assert!(browser.panel_reads > 1);
        let xpath = format!("find xpath={}", snippet_xpath("/rsvp/abc-123"));
        assert!(browser.calls.contains(&xpath));
    }

    #[test]
    fn test_snippet_found_by_xpath_fallback() {
        let mut browser = ScriptedBrowser {
            present: vec![snippet_xpath("/rsvp/abc-123")],
            ..Default::default()
        };
        let found = poll_for_snippet(&mut browser, "/rsvp/abc-123", Duration::ZERO, Duration::ZERO).unwrap();
        assert!(found);
    }

    #[test]
    fn test_login_screen_states() {
        let mut browser = ScriptedBrowser::default();
        assert_eq!(check_login(&mut browser).unwrap(), LoginScreen::Loading);

        browser.present = vec![QR_MARKERS[0].to_string()];
        assert_eq!(check_login(&mut browser).unwrap(), LoginScreen::QrCode);

        browser.present.push("#pane-side".to_string());
        assert_eq!(check_login(&mut browser).unwrap(), LoginScreen::LoggedIn);
    }

    #[test]
    fn test_compose_box_xpath_fallback() {
        let mut browser = ScriptedBrowser {
            present: vec![locator_value(COMPOSE_BOX[2])],
            ..Default::default()
        };
        let found = locate_compose_box(&mut browser, Duration::ZERO).unwrap();
        assert_eq!(found, Some(locator_value(COMPOSE_BOX[2])));
        let lookups: Vec<&String> = browser.calls.iter().filter(|c| c.starts_with("find")).collect();
        assert_eq!(lookups.len(), 3);

        let mut empty = ScriptedBrowser::default();
        assert_eq!(locate_compose_box(&mut empty, Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_keystrokes_newline_uses_shift_enter() {
        let keys = keystrokes("hi\r\nyo");
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], "h");
        assert_eq!(keys[2], "\u{E008}\u{E007}\u{E000}");
        assert_eq!(keys[4], "o");
    }

    #[test]
    fn test_bmp_detection() {
        assert!(is_bmp("שלום Dana"));
        assert!(!is_bmp("congrats 🎉"));
    }

    #[test]
    fn test_text_to_html() {
        assert_eq!(text_to_html("a\r\nb\nc"), "a<br>b<br>c");
        assert_eq!(text_to_html("<b>&"), "&lt;b&gt;&amp;");
    }

    #[test]
    fn test_still_holds() {
        assert!(still_holds("Hi Dana\nsee you", "Hi Dana\nsee you"));
        assert!(!still_holds("", "Hi Dana"));
        assert!(!still_holds("   ", "Hi Dana"));
        assert!(!still_holds("something else", "Hi Dana"));
        assert!(still_holds("x", "\n\n x"));
    }

    #[test]
    fn test_conversation_url() {
        assert_eq!(
            conversation_url("https://web.whatsapp.com/", "+972-52-111-2222"),
            "https://web.whatsapp.com/send?phone=972521112222&type=phone_number&app_absent=0"
        );
    }

    #[test]
    fn test_initialize_without_chromedriver() {
        let temp = TempDir::new().unwrap();
        let mut config = BotConfig::for_test(temp.path());
        config.chromedriver = Some(temp.path().join("missing-chromedriver"));

        let mut session = WebChatSession::new(&config);
        assert_eq!(session.state(), SessionState::Uninitialized);

        let err = session.initialize().unwrap_err();
        assert!(matches!(err, Error::SessionInit(_)));
        assert!(err.is_run_fatal());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_logged_in());

        // Shutdown after a failed start is harmless
        session.shutdown();
        session.shutdown();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_actions_need_running_browser() {
        let temp = TempDir::new().unwrap();
        let config = BotConfig::for_test(temp.path());
        let mut session = WebChatSession::new(&config);

        assert!(session.open_conversation("972500000000").is_err());
        assert!(session.insert_and_send("hello").is_err());
        assert!(session.verify_delivery("x", Duration::ZERO).is_err());
    }

    #[test]
    fn test_logged_in_states() {
        assert!(SessionState::ChatOpen.is_logged_in());
        assert!(SessionState::Verifying.is_logged_in());
        assert!(!SessionState::AwaitingLogin.is_logged_in());
        assert!(!SessionState::Closed.is_logged_in());
    }

    #[test]
    #[ignore] // Needs chromedriver, Chrome and a linked profile
    fn test_login_with_real_browser() {
        let config = BotConfig::from_env().unwrap();
        let mut session = WebChatSession::new(&config);
        session.initialize().unwrap();
        let logged_in = session.await_login(Duration::from_secs(60)).unwrap();
        println!("logged in: {}", logged_in);
        session.shutdown();
    }
}
