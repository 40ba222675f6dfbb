use crate::SessionId;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}
