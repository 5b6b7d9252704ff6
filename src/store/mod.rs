//! Persistence layer: libSQL-backed storage for rooms, accounts and sessions.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AttachmentRecord, ComposeRecord, Database, InboundAccount, NewInboundAccount,
    NewOutboundAccount, OutboundAccount, Room, RoomAccounts,
};
