//! RSVP outreach bot
//!
//! Delivers wedding invitations and reminders through WhatsApp Web, either
//! from a local guest database or on behalf of a remote dispatch server.

pub mod browser;
pub mod composer;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod pacing;
pub mod remote;
pub mod session;
pub mod sheet;
pub mod strategy;

pub use error::{Error, Result};
