use thiserror::Error;

use crate::server::queue::QueueClosed;
use crate::server::token::TokenError;
use crate::store::StoreError;

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the capability errors raised by the
/// store, the token codec and the notification queues.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Queue(#[from] QueueClosed),

    #[error("invalid session: {0}")]
    InvalidSession(String),

    #[error("user {user} lacks capability {capability}")]
    NotAuthorized { user: String, capability: String },
}
