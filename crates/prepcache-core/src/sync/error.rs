use thiserror::Error;

/// Reasons the coordinator refuses or fails an operation.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No member is signed in")]
    NotSignedIn,

    #[error("Cache belongs to {cache_owner}, cannot sign in {user_id}")]
    WrongMember { cache_owner: String, user_id: String },

    #[error("Device is offline")]
    Offline,

    #[error("Cache error: {0:#}")]
    Cache(#[from] anyhow::Error),
}
