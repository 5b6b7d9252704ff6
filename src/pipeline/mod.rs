//! Inbound mail processing.
//!
//! Every fetched mail flows through:
//! 1. `DedupLedger`: skip what the room has already seen, record the rest
//! 2. `BlocklistFilter`: drop mail from blocked senders
//! 3. `Notifier`: post the mail into the room

pub mod dedup;
pub mod email_processor;
pub mod rules;

pub use dedup::{DedupLedger, mail_id};
pub use email_processor::{BatchOutcome, MailPipeline};
pub use rules::BlocklistFilter;
