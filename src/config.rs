//! Bot configuration
//!
//! Built once from the process environment (after `.env` is loaded) and
//! passed to every component's constructor.

use crate::error::{Error, Result};
use crate::pacing::Pacing;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// WhatsApp Web entry point
pub const CHAT_BASE_URL: &str = "https://web.whatsapp.com";

pub const DEFAULT_WEBSITE_URL: &str = "http://localhost:5000";
pub const DEFAULT_COUPLE_NAMES: &str = "החתן והכלה";
pub const DEFAULT_WEDDING_DATE: &str = "תאריך החתונה";
pub const DEFAULT_COUNTRY_CODE: &str = "972";

/// Bounded waits used by the session manager and delivery engine
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub login: Duration,
    pub login_poll: Duration,
    pub open_chat: Duration,
    pub compose_box: Duration,
    pub send_button: Duration,
    pub verify: Duration,
    pub verify_poll: Duration,
    pub driver_start: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            login: Duration::from_secs(300),
            login_poll: Duration::from_secs(3),
            open_chat: Duration::from_secs(25),
            compose_box: Duration::from_secs(8),
            send_button: Duration::from_secs(3),
            verify: Duration::from_secs(10),
            verify_poll: Duration::from_millis(500),
            driver_start: Duration::from_secs(15),
        }
    }
}

/// All configurable paths and constants
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub profile_dir: PathBuf,
    pub remote_profile_dir: PathBuf,
    pub chromedriver: Option<PathBuf>,
    pub chrome_binary: Option<PathBuf>,
    pub headless: bool,
    pub chat_base_url: String,
    pub website_url: String,
    pub remote_base_url: String,
    pub api_key: Option<String>,
    pub couple_names: String,
    pub wedding_date: String,
    pub invitation_template: PathBuf,
    pub reminder_template: PathBuf,
    pub custom_template: PathBuf,
    pub country_code: String,
    pub supported_country_codes: Vec<String>,
    pub verify_reminders: bool,
    pub timeouts: Timeouts,
    pub pacing: Pacing,
}

impl Default for BotConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rsvp-outreach");

        Self {
            db_path: data_dir.join("wedding.db"),
            profile_dir: data_dir.join("whatsapp_profile"),
            remote_profile_dir: data_dir.join("whatsapp_profile_remote"),
            data_dir,
            chromedriver: None,
            chrome_binary: None,
            headless: false,
            chat_base_url: CHAT_BASE_URL.to_string(),
            website_url: DEFAULT_WEBSITE_URL.to_string(),
            remote_base_url: DEFAULT_WEBSITE_URL.to_string(),
            api_key: None,
            couple_names: DEFAULT_COUPLE_NAMES.to_string(),
            wedding_date: DEFAULT_WEDDING_DATE.to_string(),
            invitation_template: PathBuf::from("templates/invitation_template.txt"),
            reminder_template: PathBuf::from("templates/reminder_template.txt"),
            custom_template: PathBuf::from("templates/custom_template.txt"),
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            supported_country_codes: vec![DEFAULT_COUNTRY_CODE.to_string()],
            verify_reminders: false,
            timeouts: Timeouts::default(),
            pacing: Pacing::default(),
        }
    }
}

impl BotConfig {
    /// Defaults overlaid with process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = get("WEDDING_DB") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("WHATSAPP_PROFILE_DIR") {
            config.profile_dir = PathBuf::from(v);
        }
        if let Some(v) = get("WHATSAPP_REMOTE_PROFILE_DIR") {
            config.remote_profile_dir = PathBuf::from(v);
        }
        config.chromedriver = get("CHROMEDRIVER_PATH").map(PathBuf::from);
        config.chrome_binary = get("CHROME_BINARY").map(PathBuf::from);
        if let Some(v) = get("HEADLESS") {
            config.headless = parse_flag("HEADLESS", &v)?;
        }
        if let Some(v) = get("REMOTE_BASE_URL") {
            config.remote_base_url = v;
        }
        config.website_url = get("WEBSITE_URL").unwrap_or_else(|| config.remote_base_url.clone());
        config.api_key = get("BOT_API_KEY");
        if let Some(v) = get("COUPLE_NAMES") {
            config.couple_names = v;
        }
        if let Some(v) = get("WEDDING_DATE") {
            config.wedding_date = v;
        }
        if let Some(v) = get("INVITATION_TEMPLATE_PATH") {
            config.invitation_template = PathBuf::from(v);
        }
        if let Some(v) = get("REMINDER_TEMPLATE_PATH") {
            config.reminder_template = PathBuf::from(v);
        }
        if let Some(v) = get("CUSTOM_TEMPLATE_PATH") {
            config.custom_template = PathBuf::from(v);
        }
        if let Some(v) = get("DEFAULT_COUNTRY_CODE") {
            let code = v.trim_start_matches('+').to_string();
            if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::Config(format!("DEFAULT_COUNTRY_CODE must be digits, got {:?}", v)));
            }
            config.supported_country_codes = vec![code.clone()];
            config.country_code = code;
        }
        if let Some(v) = get("VERIFY_REMINDERS") {
            config.verify_reminders = parse_flag("VERIFY_REMINDERS", &v)?;
        }

        Ok(config)
    }

    /// Create config for testing with custom paths and no delays
    pub fn for_test(temp_dir: &Path) -> Self {
        let timeouts = Timeouts {
            login: Duration::from_secs(5),
            login_poll: Duration::from_millis(10),
            open_chat: Duration::from_secs(1),
            compose_box: Duration::from_secs(1),
            send_button: Duration::from_millis(100),
            verify: Duration::from_secs(8),
            verify_poll: Duration::from_millis(10),
            driver_start: Duration::from_secs(1),
        };

        Self {
            data_dir: temp_dir.to_path_buf(),
            db_path: temp_dir.join("wedding.db"),
            profile_dir: temp_dir.join("whatsapp_profile"),
            remote_profile_dir: temp_dir.join("whatsapp_profile_remote"),
            chromedriver: None,
            chrome_binary: None,
            headless: true,
            chat_base_url: CHAT_BASE_URL.to_string(),
            website_url: "https://wedding.example.com".to_string(),
            remote_base_url: "https://wedding.example.com".to_string(),
            api_key: Some("test-key".to_string()),
            couple_names: "Noa & Hod".to_string(),
            wedding_date: "01/01/2026".to_string(),
            invitation_template: temp_dir.join("templates/invitation_template.txt"),
            reminder_template: temp_dir.join("templates/reminder_template.txt"),
            custom_template: temp_dir.join("templates/custom_template.txt"),
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            supported_country_codes: vec![DEFAULT_COUNTRY_CODE.to_string()],
            verify_reminders: false,
            timeouts,
            pacing: Pacing::none(),
        }
    }

    /// Same config, but driving the remote-mode browser profile
    pub fn with_remote_profile(&self) -> Self {
        let mut config = self.clone();
        config.profile_dir = self.remote_profile_dir.clone();
        config
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{} must be a boolean, got {:?}", key, other))),
    }
}
