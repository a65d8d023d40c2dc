//! Sessions and conversation persistence for the okvm agent runtime.
//!
//! The [`SessionStore`] binds each [`ClientKey`] to a live [`Session`]: a
//! workspace, the tools bound to it, and the in-memory history. Finished
//! turns are recorded through a [`ConversationStore`], which outlives both
//! the session and the process.

pub mod config;
pub mod conversation;
pub mod file_store;
pub mod identity;
pub mod session;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod store;

pub use config::{ConversationStoreConfig, SessionConfig, StoreBackend};
pub use conversation::{
    derive_title, ConversationRecord, ConversationStore, ConversationSummary, StoredMessage,
    TurnAppend, TurnEntry,
};
pub use file_store::FileConversationStore;
pub use identity::{
    client_cookie, derive_client_key, ClientKey, CLIENT_COOKIE, CLIENT_HEADER, CLIENT_QUERY_PARAM,
};
pub use session::{Binding, Session};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteConversationStore;
pub use store::SessionStore;

use okvm_core::OkvmResult;
use std::sync::Arc;

/// Opens the conversation store described by `config`.
pub async fn open_conversation_store(
    config: &ConversationStoreConfig,
) -> OkvmResult<Arc<dyn ConversationStore>> {
    match config.backend {
        StoreBackend::File => Ok(Arc::new(
            FileConversationStore::new(config.path.clone()).await?,
        )),
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite => Ok(Arc::new(
            SqliteConversationStore::open(config.path.clone()).await?,
        )),
        #[cfg(not(feature = "sqlite"))]
        StoreBackend::Sqlite => Err(okvm_core::OkvmError::Config(
            "the sqlite conversation store needs the `sqlite` feature".into(),
        )),
    }
}
