pub mod entities;
mod billing;
mod credits;
mod sessions;
mod storage;
mod store;
mod users;
mod workspaces;

pub use entities::{
    ActiveSessionRow, NewUser, SessionAttachmentRecord, SessionBillingRecord, SessionRecord,
    SessionUpdate, StorageResourceRecord, UserRecord, UserUpdate, WorkspaceRecord,
};
pub use store::Store;
