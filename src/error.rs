//! Error types for rsvp-outreach

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Browser session could not start: {0}")]
    SessionInit(String),

    #[error("No logged-in chat session detected within {0}s")]
    LoginTimeout(u64),

    #[error("Could not open conversation with {0}")]
    ConversationOpen(String),

    #[error("Could not insert message text: {0}")]
    ComposeInsert(String),

    #[error("Could not submit message: {0}")]
    SendFailed(String),

    #[error("Message submitted but not found in conversation: {0}")]
    SendUnconfirmed(String),

    #[error("Dispatch API error: {0}")]
    RemoteApi(String),

    #[error("WebDriver error ({code}): {message}")]
    WebDriver { code: String, message: String },

    #[error("Guest not found: {0}")]
    GuestNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(i64),

    #[error("Unsupported phone number: {0}")]
    UnsupportedPhone(String),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Sheet error: {0}")]
    Sheet(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// Driver error codes meaning the browser session is gone
const SESSION_LOST_CODES: [&str; 3] = ["invalid session id", "no such window", "session not created"];

impl From<thirtyfour::error::WebDriverError> for Error {
    fn from(e: thirtyfour::error::WebDriverError) -> Self {
        Error::from_driver_message(e.to_string())
    }
}

impl Error {
    pub fn webdriver(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::WebDriver {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classify a driver failure by its message, keeping session-loss codes recognizable
    pub fn from_driver_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        let code = SESSION_LOST_CODES
            .iter()
            .find(|code| lowered.contains(*code))
            .copied()
            .unwrap_or("webdriver");
        Error::webdriver(code, message)
    }

    /// Errors that end a whole run rather than a single guest attempt
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Error::SessionInit(_) | Error::LoginTimeout(_))
    }

    /// The browser behind the WebDriver session is gone
    pub fn is_session_lost(&self) -> bool {
        match self {
            Error::WebDriver { code, .. } => SESSION_LOST_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::GuestNotFound("42".to_string());
        assert!(err.to_string().contains("42"));

        let err = Error::LoginTimeout(300);
        assert!(err.to_string().contains("300s"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_run_fatal_classification() {
        assert!(Error::SessionInit("no chromedriver".into()).is_run_fatal());
        assert!(Error::LoginTimeout(60).is_run_fatal());
        assert!(!Error::ConversationOpen("972500000000".into()).is_run_fatal());
        assert!(!Error::SendUnconfirmed("/rsvp/x".into()).is_run_fatal());
        assert!(!Error::RemoteApi("502".into()).is_run_fatal());
    }

    #[test]
    fn test_session_lost_codes() {
        assert!(Error::webdriver("invalid session id", "gone").is_session_lost());
        assert!(Error::webdriver("no such window", "closed").is_session_lost());
        assert!(!Error::webdriver("no such element", "missing").is_session_lost());
        assert!(!Error::Config("x".into()).is_session_lost());
    }

    #[test]
    fn test_driver_message_classification() {
        let err = Error::from_driver_message("The WebDriver server returned: invalid session id: session deleted");
        assert!(err.is_session_lost());
        assert!(err.to_string().contains("session deleted"));

        let err = Error::from_driver_message("No Such Window: target window already closed");
        assert!(err.is_session_lost());

        let err = Error::from_driver_message("no such element: #main");
        assert!(!err.is_session_lost());
        assert!(matches!(err, Error::WebDriver { ref code, .. } if code == "webdriver"));
    }
}
