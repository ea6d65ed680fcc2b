//! # Duewatch Channels
//! Outbound reminder transports. Each implements the scheduler's
//! [`Transport`](duewatch_scheduler::Transport) seam; message rendering —
//! including the recipient's local time — happens here, never in the core.

pub mod console;
pub mod render;
pub mod telegram;
pub mod webhook;

pub use console::ConsoleSender;
pub use telegram::TelegramSender;
pub use webhook::WebhookSender;
