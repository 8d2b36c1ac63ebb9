//! Local-mode delivery engine
//!
//! Walks guests from the directory, sends each one its message through a
//! `ChatSession`, and only flips `message_sent` once the invite link has been
//! seen in the conversation.

use crate::composer::{is_supported_phone, normalize_phone, MessageComposer, MessageKind};
use crate::config::BotConfig;
use crate::directory::{Directory, Guest};
use crate::error::{Error, Result};
use crate::pacing::Pacing;
use crate::session::{ensure_logged_in, ChatSession};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Result of one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Submitted and the marker was found in the conversation
    Verified,
    /// Submitted; verification was not requested
    Sent,
    /// Submitted but the marker never showed up
    SendUnconfirmed,
    OpenFailed,
    SendFailed,
    /// Phone number outside the supported country codes
    Rejected,
}

impl DeliveryOutcome {
    /// Whether this outcome counts as delivered
    pub fn marks_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Verified | DeliveryOutcome::Sent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Verified => "verified",
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::SendUnconfirmed => "send_unconfirmed",
            DeliveryOutcome::OpenFailed => "open_failed",
            DeliveryOutcome::SendFailed => "send_failed",
            DeliveryOutcome::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One guest, one message, one outcome
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub guest_id: i64,
    pub guest_name: String,
    pub phone: String,
    pub text: String,
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Attempts collected over one batch run
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub attempts: Vec<DeliveryAttempt>,
}

impl BatchReport {
    pub fn success_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.outcome.marks_sent()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.attempts.iter().filter(|a| !a.outcome.marks_sent())
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// A rendered message that was not sent
#[derive(Debug, Clone)]
pub struct Preview {
    pub guest: Guest,
    pub phone: String,
    pub text: String,
}

pub struct DeliveryEngine<S: ChatSession> {
    session: S,
    directory: Directory,
    composer: MessageComposer,
    country_code: String,
    supported_country_codes: Vec<String>,
    login_timeout: Duration,
    verify_timeout: Duration,
    verify_reminders: bool,
    pacing: Pacing,
}

impl<S: ChatSession> DeliveryEngine<S> {
    pub fn new(session: S, directory: Directory, config: &BotConfig) -> Self {
        Self {
            session,
            directory,
            composer: MessageComposer::new(config),
            country_code: config.country_code.clone(),
            supported_country_codes: config.supported_country_codes.clone(),
            login_timeout: config.timeouts.login,
            verify_timeout: config.timeouts.verify,
            verify_reminders: config.verify_reminders,
            pacing: config.pacing.clone(),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn composer(&self) -> &MessageComposer {
        &self.composer
    }

    /// Start the browser if needed and wait for a logged-in client
    pub fn ensure_logged_in(&mut self) -> Result<()> {
        ensure_logged_in(&mut self.session, self.login_timeout)
    }

    pub fn send_invitation(&mut self, guest: &Guest) -> Result<DeliveryAttempt> {
        let attempt = self.deliver(guest, MessageKind::Invitation)?;
        if attempt.outcome == DeliveryOutcome::Verified {
            self.directory.mark_message_sent(guest.id)?;
        }
        Ok(attempt)
    }

    /// Reminders never read or write the send flag
    pub fn send_reminder(&mut self, guest: &Guest) -> Result<DeliveryAttempt> {
        self.deliver(guest, MessageKind::Reminder)
    }

    pub fn send_one(&mut self, guest_id: i64) -> Result<DeliveryAttempt> {
        let guest = self
            .directory
            .get_guest(guest_id)?
            .ok_or_else(|| Error::GuestNotFound(guest_id.to_string()))?;

        let preview = self.composer.render(&guest, MessageKind::Invitation);
        info!(guest_id = guest.id, "sending to {} ({}):\n{}", guest.name, guest.phone, preview);

        self.send_invitation(&guest)
    }

    /// Invite every guest whose invitation is not yet verified
    pub fn send_to_all(&mut self, limit: Option<usize>) -> Result<BatchReport> {
        let guests = self.directory.pending_invitations(limit)?;
        info!("{} guests waiting for an invitation", guests.len());
        self.run_batch(&guests, MessageKind::Invitation)
    }

    /// Remind guests that were invited but have not answered
    pub fn send_pending_reminders(&mut self, limit: Option<usize>) -> Result<BatchReport> {
        let guests = self.directory.awaiting_response(limit)?;
        info!("{} guests waiting for a reminder", guests.len());
        self.run_batch(&guests, MessageKind::Reminder)
    }

    /// Render what a batch would send without touching the session or the directory
    pub fn dry_run(&self, kind: MessageKind, limit: Option<usize>) -> Result<Vec<Preview>> {
        let guests = match kind {
            MessageKind::Reminder => self.directory.awaiting_response(limit)?,
            _ => self.directory.pending_invitations(limit)?,
        };

        let previews: Vec<Preview> = guests
            .into_iter()
            .map(|guest| Preview {
                phone: normalize_phone(&guest.phone, &self.country_code),
                text: self.composer.render(&guest, kind),
                guest,
            })
            .collect();

        for p in &previews {
            info!(guest_id = p.guest.id, "[dry run] {} to {} ({})", kind, p.guest.name, p.phone);
        }
        Ok(previews)
    }

    /// Close the browser
    pub fn shutdown(&mut self) {
        self.session.shutdown();
    }

    fn run_batch(&mut self, guests: &[Guest], kind: MessageKind) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        for (idx, guest) in guests.iter().enumerate() {
            let attempt = match kind {
                MessageKind::Invitation => self.send_invitation(guest)?,
                _ => self.deliver(guest, kind)?,
            };
            report.attempts.push(attempt);

            if idx + 1 < guests.len() {
                self.pacing.inter_guest.pause();
            }
        }

        info!(
            "{} run finished: {}/{} delivered",
            kind,
            report.success_count(),
            report.len()
        );
        Ok(report)
    }

    fn deliver(&mut self, guest: &Guest, kind: MessageKind) -> Result<DeliveryAttempt> {
        let phone = normalize_phone(&guest.phone, &self.country_code);
        let text = self.composer.render(guest, kind);

        let attempt = |outcome: DeliveryOutcome, detail: Option<String>| DeliveryAttempt {
            guest_id: guest.id,
            guest_name: guest.name.clone(),
            phone: phone.clone(),
            text: text.clone(),
            outcome,
            detail,
            at: Utc::now(),
        };

        if !is_supported_phone(&phone, &self.supported_country_codes) {
            let err = Error::UnsupportedPhone(phone.clone());
            warn!(guest_id = guest.id, "{}, skipping {}", err, guest.name);
            return Ok(attempt(DeliveryOutcome::Rejected, Some(err.to_string())));
        }

        self.ensure_logged_in()?;

        let marker = match kind {
            MessageKind::Invitation => Some(MessageComposer::link_marker(&guest.unique_token)),
            MessageKind::Reminder if self.verify_reminders => Some(MessageComposer::link_marker(&guest.unique_token)),
            _ => None,
        };
        let (outcome, detail) = open_and_send(
            &mut self.session,
            &phone,
            &text,
            marker.as_deref().map(|m| (m, self.verify_timeout)),
        );
        self.pacing.cooldown.pause();

        match outcome {
            DeliveryOutcome::Verified | DeliveryOutcome::Sent => {
                info!(guest_id = guest.id, outcome = %outcome, "{} delivered to {}", kind, guest.name)
            }
            DeliveryOutcome::SendUnconfirmed => warn!(
                guest_id = guest.id,
                outcome = %outcome,
                "{} to {} was submitted but never showed up in the chat; not marking as sent",
                kind,
                guest.name
            ),
            _ => warn!(
                guest_id = guest.id,
                outcome = %outcome,
                "{} to {} failed: {}",
                kind,
                guest.name,
                detail.as_deref().unwrap_or("")
            ),
        }

        Ok(attempt(outcome, detail))
    }
}

/// Open the chat, send, and optionally look for `marker` for up to the given timeout
pub fn open_and_send<S: ChatSession + ?Sized>(
    session: &mut S,
    phone: &str,
    text: &str,
    marker: Option<(&str, Duration)>,
) -> (DeliveryOutcome, Option<String>) {
    match session.open_conversation(phone) {
        Ok(true) => {}
        Ok(false) => {
            return (
                DeliveryOutcome::OpenFailed,
                Some(Error::ConversationOpen(phone.to_string()).to_string()),
            )
        }
        Err(e) => return (DeliveryOutcome::OpenFailed, Some(e.to_string())),
    }

    if let Err(e) = session.insert_and_send(text) {
        return (DeliveryOutcome::SendFailed, Some(e.to_string()));
    }

    let Some((marker, timeout)) = marker else {
        return (DeliveryOutcome::Sent, None);
    };

    match session.verify_delivery(marker, timeout) {
        Ok(true) => (DeliveryOutcome::Verified, None),
        Ok(false) => (
            DeliveryOutcome::SendUnconfirmed,
            Some(Error::SendUnconfirmed(marker.to_string()).to_string()),
        ),
        Err(e) => (DeliveryOutcome::SendUnconfirmed, Some(e.to_string())),
    }
}
