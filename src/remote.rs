//! Remote dispatch mode
//!
//! The dispatch server owns guest state. Each cycle fetches pending guests,
//! sends their messages through a `ChatSession`, and reports back which ids
//! were sent and which failed.

use crate::composer::{normalize_phone, MessageComposer};
use crate::config::BotConfig;
use crate::delivery::{open_and_send, DeliveryOutcome};
use crate::error::{Error, Result};
use crate::pacing::Pacing;
use crate::session::{ensure_logged_in, ChatSession};
use crate::sheet::{load_recipients, ColumnHints};
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const REPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// A guest the server wants messaged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingGuest {
    pub id: i64,
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub unique_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    guests: Vec<PendingGuest>,
    #[serde(default)]
    error: Option<String>,
}

/// Any 2xx acknowledgement counts unless it says `"success": false`
#[derive(Debug, Deserialize)]
struct MarkResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Why a send failed, as the server expects it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    OpenChatFailed,
    SendFailed,
}

impl FailureReason {
    /// `None` for outcomes that count as sent
    pub fn from_outcome(outcome: DeliveryOutcome) -> Option<Self> {
        match outcome {
            DeliveryOutcome::OpenFailed | DeliveryOutcome::Rejected => Some(FailureReason::OpenChatFailed),
            DeliveryOutcome::SendFailed | DeliveryOutcome::SendUnconfirmed => Some(FailureReason::SendFailed),
            DeliveryOutcome::Verified | DeliveryOutcome::Sent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub id: i64,
    pub error: FailureReason,
}

/// Body of `POST /api/bot/mark`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRequest {
    pub sent: Vec<i64>,
    pub failed: Vec<FailedEntry>,
}

impl MarkRequest {
    /// Build a report; duplicate ids keep their first position
    pub fn new(sent: Vec<i64>, failed: Vec<FailedEntry>) -> Self {
        let mut request = Self::default();
        for id in sent {
            if !request.sent.contains(&id) {
                request.sent.push(id);
            }
        }
        for entry in failed {
            if !request.sent.contains(&entry.id) && !request.failed.iter().any(|f| f.id == entry.id) {
                request.failed.push(entry);
            }
        }
        request
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.failed.is_empty()
    }
}

/// The dispatch server's bot endpoints
pub trait DispatchApi {
    fn fetch_pending(&self, limit: usize, include_resend: bool) -> Result<Vec<PendingGuest>>;
    fn report_outcome(&self, request: &MarkRequest) -> Result<()>;
}

/// HTTP client for the dispatch server
pub struct DispatchClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl DispatchClient {
    pub fn new(config: &BotConfig) -> Result<Self> {
        if config.api_key.is_none() {
            warn!("BOT_API_KEY not set, the dispatch server will likely reject requests");
        }
        Ok(Self {
            http: Client::builder().build()?,
            base_url: config.remote_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-API-KEY", key),
            None => request,
        }
    }

    fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let resp = self
            .authorized(request)
            .send()
            .map_err(|e| Error::RemoteApi(format!("{}: {}", what, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(Error::RemoteApi(format!(
                "{} returned {}: {}",
                what,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        resp.json()
            .map_err(|e| Error::RemoteApi(format!("{}: unreadable response: {}", what, e)))
    }
}

impl DispatchApi for DispatchClient {
    fn fetch_pending(&self, limit: usize, include_resend: bool) -> Result<Vec<PendingGuest>> {
        let mut request = self
            .http
            .get(format!("{}/api/bot/pending", self.base_url))
            .timeout(FETCH_TIMEOUT)
            .query(&[("limit", limit.to_string())]);
        if include_resend {
            request = request.query(&[("resend", "1")]);
        }

        let body: PendingResponse = self.send_json(request, "fetch pending")?;
        if !body.success {
            return Err(Error::RemoteApi(format!(
                "fetch pending: {}",
                body.error.unwrap_or_else(|| "server reported failure".to_string())
            )));
        }
        Ok(body.guests)
    }

    fn report_outcome(&self, mark: &MarkRequest) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/api/bot/mark", self.base_url))
            .timeout(REPORT_TIMEOUT)
            .json(mark);

        let body: MarkResponse = self.send_json(request, "report outcome")?;
        if body.success == Some(false) {
            return Err(Error::RemoteApi(format!(
                "report outcome: {}",
                body.error.unwrap_or_else(|| "server reported failure".to_string())
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub limit: usize,
    pub include_resend: bool,
    pub dry_run: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            limit: 15,
            include_resend: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub cycle: CycleOptions,
    pub interval: Duration,
    /// Stop after this many cycles; `None` runs until the process is killed
    pub max_cycles: Option<usize>,
}

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub fetched: usize,
    pub mark: MarkRequest,
    pub dry_run: bool,
    /// Whether `mark` was posted to the server
    pub reported: bool,
}

/// Fetch, send, report against a dispatch server
pub struct RemoteRunner<S: ChatSession, A: DispatchApi> {
    session: S,
    api: A,
    composer: MessageComposer,
    country_code: String,
    login_timeout: Duration,
    pacing: Pacing,
}

impl<S: ChatSession, A: DispatchApi> RemoteRunner<S, A> {
    pub fn new(session: S, api: A, config: &BotConfig) -> Self {
        Self {
            session,
            api,
            composer: MessageComposer::new(config),
            country_code: config.country_code.clone(),
            login_timeout: config.timeouts.login,
            pacing: config.pacing.clone(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn run_cycle(&mut self, opts: &CycleOptions) -> Result<CycleReport> {
        info!(
            "fetching up to {} guests (resend failed: {})",
            opts.limit, opts.include_resend
        );
        let guests = self.api.fetch_pending(opts.limit, opts.include_resend)?;
        if guests.is_empty() {
            info!("no guests to send");
            return Ok(CycleReport {
                dry_run: opts.dry_run,
                ..Default::default()
            });
        }

        info!("will attempt {} sends", guests.len());
        let mut sent = Vec::new();
        let mut failed = Vec::new();
        let mut fatal: Option<Error> = None;

        for (idx, guest) in guests.iter().enumerate() {
            let phone = normalize_phone(&guest.phone, &self.country_code);
            let text = match guest.message.as_deref().map(str::trim) {
                Some(m) if !m.is_empty() => m.to_string(),
                _ => self
                    .composer
                    .remote_fallback(&guest.name, guest.unique_token.as_deref()),
            };
            info!(guest_id = guest.id, "[{}/{}] {} -> {}", idx + 1, guests.len(), guest.name, phone);

            if opts.dry_run {
                info!(guest_id = guest.id, "[dry run] message preview:\n{}", text);
                sent.push(guest.id);
                continue;
            }

            if let Err(e) = ensure_logged_in(&mut self.session, self.login_timeout) {
                fatal = Some(e);
                break;
            }

            let (outcome, detail) = open_and_send(&mut self.session, &phone, &text, None);
            match FailureReason::from_outcome(outcome) {
                None => {
                    sent.push(guest.id);
                    self.pacing.remote_sent.pause();
                }
                Some(reason) => {
                    warn!(
                        guest_id = guest.id,
                        outcome = %outcome,
                        "send to {} failed: {}",
                        guest.name,
                        detail.as_deref().unwrap_or("")
                    );
                    failed.push(FailedEntry {
                        id: guest.id,
                        error: reason,
                    });
                    if reason == FailureReason::SendFailed {
                        self.pacing.remote_failed.pause();
                    }
                }
            }
        }

        if !opts.dry_run {
            self.session.shutdown();
        }

        let mark = MarkRequest::new(sent, failed);
        let mut report = CycleReport {
            fetched: guests.len(),
            mark,
            dry_run: opts.dry_run,
            reported: false,
        };

        if opts.dry_run {
            info!(
                "[dry run] would report: {}",
                serde_json::to_string(&report.mark)?
            );
        } else if !report.mark.is_empty() {
            info!(
                "reporting results: {} sent, {} failed",
                report.mark.sent.len(),
                report.mark.failed.len()
            );
            let posted = self.api.report_outcome(&report.mark);
            // A fatal session error outranks a failed report
            if let Some(e) = fatal.take() {
                if let Err(report_err) = posted {
                    error!("could not report partial results: {}", report_err);
                }
                return Err(e);
            }
            posted?;
            report.reported = true;
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Run cycles with a fixed pause between them
    pub fn run_loop(&mut self, opts: &LoopOptions) -> Result<usize> {
        let mut cycles = 0;
        loop {
            cycles += 1;
            match self.run_cycle(&opts.cycle) {
                Ok(report) => info!(
                    "cycle {} done: {} fetched, {} sent, {} failed",
                    cycles,
                    report.fetched,
                    report.mark.sent.len(),
                    report.mark.failed.len()
                ),
                Err(e) if e.is_run_fatal() => {
                    error!("cycle {} stopped the loop: {}", cycles, e);
                    return Err(e);
                }
                Err(e) => warn!("cycle {} failed, will retry: {}", cycles, e),
            }

            if opts.max_cycles.is_some_and(|max| cycles >= max) {
                return Ok(cycles);
            }
            info!("sleeping {}s", opts.interval.as_secs());
            std::thread::sleep(opts.interval);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub phone: String,
    pub error: FailureReason,
}

/// Outcome of a send_file run
#[derive(Debug, Clone, Default)]
pub struct FileSendReport {
    pub sent: Vec<String>,
    pub failed: Vec<FileFailure>,
    pub previewed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FileSendOptions {
    pub sheet: Option<String>,
    pub hints: ColumnHints,
    pub dry_run: bool,
}

/// Send to every recipient row in a local sheet
pub fn send_from_file<S: ChatSession>(
    session: &mut S,
    config: &BotConfig,
    path: &Path,
    opts: &FileSendOptions,
) -> Result<FileSendReport> {
    let recipients = load_recipients(path, opts.sheet.as_deref(), &opts.hints)?;
    info!("{} recipients in {}", recipients.len(), path.display());

    let composer = MessageComposer::new(config);
    let mut report = FileSendReport::default();

    for recipient in &recipients {
        let phone = normalize_phone(&recipient.phone, &config.country_code);
        let text = recipient
            .message
            .clone()
            .unwrap_or_else(|| composer.file_fallback(&recipient.name, recipient.token.as_deref()));
        info!("row {}: {} -> {}", recipient.row, recipient.name, phone);

        if opts.dry_run {
            let preview: String = text.chars().take(200).collect();
            info!("[dry run]\n{}", preview);
            report.previewed += 1;
            continue;
        }

        ensure_logged_in(session, config.timeouts.login)?;

        let (outcome, detail) = open_and_send(session, &phone, &text, None);
        match FailureReason::from_outcome(outcome) {
            None => report.sent.push(recipient.phone.clone()),
            Some(reason) => {
                warn!("row {} failed: {}", recipient.row, detail.as_deref().unwrap_or(""));
                report.failed.push(FileFailure {
                    phone: recipient.phone.clone(),
                    error: reason,
                });
                if reason == FailureReason::OpenChatFailed {
                    continue;
                }
            }
        }
        config.pacing.file_send.pause();
    }

    if !opts.dry_run {
        session.shutdown();
    }
    info!(
        "finished: {} sent, {} failed, {} previewed",
        report.sent.len(),
        report.failed.len(),
        report.previewed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    /// Answer `count` HTTP requests with `body`, handing back each raw request
    fn serve(count: usize, status: &'static str, body: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            for stream in listener.incoming().take(count) {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut head = String::new();
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap();
                    }
                    head.push_str(&line);
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                }
                let mut payload = vec![0; content_length];
                reader.read_exact(&mut payload).unwrap();
                head.push_str(&String::from_utf8(payload).unwrap());

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).unwrap();
                tx.send(head).unwrap();
            }
        });

        (url, rx)
    }

    fn client(url: &str) -> DispatchClient {
        let temp = std::env::temp_dir();
        let mut config = BotConfig::for_test(&temp);
        config.remote_base_url = url.to_string();
        DispatchClient::new(&config).unwrap()
    }

    #[test]
    fn test_mark_request_dedupes() {
        let mark = MarkRequest::new(
            vec![3, 1, 3],
            vec![
                FailedEntry { id: 1, error: FailureReason::SendFailed },
                FailedEntry { id: 7, error: FailureReason::OpenChatFailed },
                FailedEntry { id: 7, error: FailureReason::SendFailed },
            ],
        );
        assert_eq!(mark.sent, vec![3, 1]);
        assert_eq!(mark.failed, vec![FailedEntry { id: 7, error: FailureReason::OpenChatFailed }]);
    }

    #[test]
    fn test_mark_request_wire_shape() {
        let mark = MarkRequest::new(vec![1, 2], vec![FailedEntry { id: 5, error: FailureReason::OpenChatFailed }]);
        let json = serde_json::to_value(&mark).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"sent": [1, 2], "failed": [{"id": 5, "error": "open_chat_failed"}]})
        );
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(FailureReason::from_outcome(DeliveryOutcome::Sent), None);
        assert_eq!(
            FailureReason::from_outcome(DeliveryOutcome::OpenFailed),
            Some(FailureReason::OpenChatFailed)
        );
        assert_eq!(
            FailureReason::from_outcome(DeliveryOutcome::SendFailed),
            Some(FailureReason::SendFailed)
        );
    }

    #[test]
    fn test_fetch_pending_request() {
        let (url, requests) = serve(
            1,
            "200 OK",
            r#"{"success": true, "guests": [{"id": 4, "phone": "0521112222", "name": "Dana"}]}"#,
        );
        let guests = client(&url).fetch_pending(15, true).unwrap();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].id, 4);
        assert!(guests[0].message.is_none());

        let raw = requests.recv().unwrap();
        assert!(raw.starts_with("GET /api/bot/pending?limit=15&resend=1 "));
        assert!(raw.to_ascii_lowercase().contains("x-api-key: test-key"));
    }

    #[test]
    fn test_fetch_pending_failures() {
        let (url, _rx) = serve(1, "401 Unauthorized", r#"{"error": "bad key"}"#);
        assert!(matches!(client(&url).fetch_pending(5, false), Err(Error::RemoteApi(_))));

        let (url, _rx) = serve(1, "200 OK", r#"{"success": false, "error": "maintenance"}"#);
        let err = client(&url).fetch_pending(5, false).unwrap_err();
        assert!(err.to_string().contains("maintenance"));

        let (url, _rx) = serve(1, "200 OK", "not json");
        assert!(matches!(client(&url).fetch_pending(5, false), Err(Error::RemoteApi(_))));
    }

    #[test]
    fn test_report_accepts_plain_acknowledgement() {
        let (url, _rx) = serve(1, "200 OK", r#"{"updated": 2}"#);
        let mark = MarkRequest::new(vec![1, 2], vec![]);
        client(&url).report_outcome(&mark).unwrap();

        let (url, _rx) = serve(1, "200 OK", r#"{"success": false, "error": "stale ids"}"#);
        let err = client(&url).report_outcome(&mark).unwrap_err();
        assert!(err.to_string().contains("stale ids"));

        let (url, _rx) = serve(1, "500 Internal Server Error", r#"{"success": true}"#);
        assert!(matches!(client(&url).report_outcome(&mark), Err(Error::RemoteApi(_))));
    }

    #[test]
    fn test_report_payload_identical_on_repeat() {
        let (url, requests) = serve(2, "200 OK", r#"{"success": true}"#);
        let client = client(&url);
        let mark = MarkRequest::new(vec![1, 2, 2], vec![FailedEntry { id: 9, error: FailureReason::SendFailed }]);

        client.report_outcome(&mark).unwrap();
        client.report_outcome(&mark).unwrap();

        let first = requests.recv().unwrap();
        let second = requests.recv().unwrap();
        let body = |raw: &str| raw.split("\r\n\r\n").nth(1).unwrap().to_string();
        assert_eq!(body(&first), body(&second));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&body(&first)).unwrap(),
            serde_json::json!({"sent": [1, 2], "failed": [{"id": 9, "error": "send_failed"}]})
        );
    }
}
