//! Message composition and phone normalization
//!
//! Renders invitation, reminder and custom texts from an optional template
//! file, falling back to built-in texts. Rendering never fails.

use crate::config::BotConfig;
use crate::directory::Guest;
use crate::error::Result;
use minijinja::{context, Environment, UndefinedBehavior};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Which message to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Invitation,
    Reminder,
    Custom,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Invitation => write!(f, "invitation"),
            MessageKind::Reminder => write!(f, "reminder"),
            MessageKind::Custom => write!(f, "custom"),
        }
    }
}

/// Renders guest messages
#[derive(Debug, Clone)]
pub struct MessageComposer {
    website_url: String,
    couple_names: String,
    wedding_date: String,
    invitation_template: PathBuf,
    reminder_template: PathBuf,
    custom_template: PathBuf,
}

impl MessageComposer {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            website_url: config.website_url.trim_end_matches('/').to_string(),
            couple_names: config.couple_names.clone(),
            wedding_date: config.wedding_date.clone(),
            invitation_template: config.invitation_template.clone(),
            reminder_template: config.reminder_template.clone(),
            custom_template: config.custom_template.clone(),
        }
    }

    /// Guest-specific RSVP link
    pub fn invite_link(&self, token: &str) -> String {
        format!("{}/rsvp/{}", self.website_url, token)
    }

    /// The part of the link that proves a message landed in the chat
    pub fn link_marker(token: &str) -> String {
        format!("/rsvp/{}", token)
    }

    fn template_path(&self, kind: MessageKind) -> &Path {
        match kind {
            MessageKind::Invitation => &self.invitation_template,
            MessageKind::Reminder => &self.reminder_template,
            MessageKind::Custom => &self.custom_template,
        }
    }

    /// Render a message for `guest`; falls back to built-in text on any template problem
    pub fn render(&self, guest: &Guest, kind: MessageKind) -> String {
        let path = self.template_path(kind);
        if path.exists() {
            match self.render_template(path, guest) {
                Ok(text) => return text,
                Err(e) => warn!(
                    "Template {} for {} unusable, using built-in text: {}",
                    path.display(),
                    kind,
                    e
                ),
            }
        } else {
            debug!("No {} template at {}, using built-in text", kind, path.display());
        }
        self.builtin(guest, kind)
    }

    fn render_template(&self, path: &Path, guest: &Guest) -> Result<String> {
        let source = std::fs::read_to_string(path)?;
        let ctx = context! {
            name => &guest.name,
            couple_names => &self.couple_names,
            wedding_date => &self.wedding_date,
            invited_count => guest.invited_count,
            link => self.invite_link(&guest.unique_token),
            guest => guest_fields(guest),
        };
        render_source(&source, ctx)
    }

    fn builtin(&self, guest: &Guest, kind: MessageKind) -> String {
        let link = self.invite_link(&guest.unique_token);
        match kind {
            MessageKind::Invitation => format!(
                "🎉 הזמנה לחתונה! 🎉\n\n\
                 שלום {}!\n\n\
                 אנחנו שמחים להזמין אותך לחתונה של {}\n\
                 📅 תאריך: {}\n\
                 👨‍👩‍👧‍👦 מוזמנים: {}\n\n\
                 בבקשה אשר/י הגעה בקישור:\n{}\n\n\
                 מחכים לכם! 💕",
                guest.name, self.couple_names, self.wedding_date, guest.invited_count, link
            ),
            MessageKind::Reminder => format!(
                "היי {}, מזכירים בעדינות לאשר הגעה 🙏\n\
                 הקישור: {}\n\
                 זה עוזר לנו מאוד בהושבה והקייטרינג. תודה 💙",
                guest.name, link
            ),
            MessageKind::Custom => self.short_message(&guest.name, Some(&guest.unique_token)),
        }
    }

    /// Text for a remote descriptor that arrived without a pre-rendered message
    pub fn remote_fallback(&self, name: &str, token: Option<&str>) -> String {
        self.short_message(name, token)
    }

    fn short_message(&self, name: &str, token: Option<&str>) -> String {
        let link = match token {
            Some(t) if !t.is_empty() => self.invite_link(t),
            _ => self.website_url.clone(),
        };
        let mut parts = vec![format!("שלום {}", name), format!("מוזמנים ל{}", self.couple_names)];
        if !self.wedding_date.is_empty() {
            parts.push(format!("תאריך: {}", self.wedding_date));
        }
        parts.push(format!("אישור הגעה: {}", link));
        parts.join("\n")
    }

    /// Message for a send_file row with no message cell
    pub fn file_fallback(&self, name: &str, token: Option<&str>) -> String {
        let link = self.invite_link(token.unwrap_or(""));
        format!("שלום {}!\nנשמח לאישור הגעה כאן: {}", name, link)
    }
}

/// Render Jinja-style template text; undefined variables are errors
pub fn render_source(source: &str, ctx: minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    Ok(env.render_str(source, ctx)?)
}

/// Guest record for `{{ guest.* }}`, with missing fields as empty text
fn guest_fields(guest: &Guest) -> BTreeMap<String, serde_json::Value> {
    match serde_json::to_value(guest) {
        Ok(serde_json::Value::Object(fields)) => fields
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::Null => (key, serde_json::Value::String(String::new())),
                other => (key, other),
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Reduce a phone number to bare digits with a country calling code
///
/// Keeps digits and `+`, drops a leading `+`, rewrites a leading local `0`
/// to `country_code`. Idempotent.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    let digits: String = kept.trim_start_matches('+').chars().filter(|c| *c != '+').collect();
    match digits.strip_prefix('0') {
        Some(rest) => format!("{}{}", country_code, rest),
        None => digits,
    }
}

/// Whether a normalized number starts with one of the supported calling codes
pub fn is_supported_phone(normalized: &str, supported: &[String]) -> bool {
    !normalized.is_empty() && supported.iter().any(|code| normalized.starts_with(code.as_str()))
}

/// `https://wa.me/<digits>?text=<message>` quick-send link
pub fn wa_me_link(normalized_phone: &str, text: &str) -> String {
    format!(
        "https://wa.me/{}?text={}",
        normalized_phone,
        urlencoding::encode(text)
    )
}
