//! # lookout-notify
//!
//! The outward-facing side-effect collaborators the sandbox tools marshal
//! into: the messaging tools API (SMS / email / WhatsApp / call /
//! webhooks), user-facing notifications, and just-in-time auth tokens.

pub mod messenger;
pub mod notifier;
pub mod token;

pub use messenger::{HttpMessenger, MessageKind, Messenger, MockMessenger};
pub use notifier::{LogNotifier, Notifier};
pub use token::{StaticTokenProvider, TokenProvider};
