use thiserror::Error;

/// Failures talking to the academic records portal.
#[derive(Debug, Error)]
pub enum PortalError {
    /// The portal rejected the login. May be transient under portal load.
    #[error("portal authorization failed")]
    AuthenticationFailed,

    #[error("portal returned a page that is not the grades page")]
    WrongPage,

    #[error("portal did not issue a verification token")]
    MissingVerificationToken,

    #[error("portal request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("grades page marker not found")]
    NotGradesPage,

    #[error("empty control event name in discipline block {block}, row {row}")]
    EmptyEventName { block: usize, row: usize },

    #[error("empty discipline name at position {0}")]
    EmptyDisciplineName(usize),

    #[error("found {names} discipline names for {blocks} discipline blocks")]
    NameCountMismatch { names: usize, blocks: usize },

    #[error("progress table contains invalid text")]
    InvalidText,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("ciphertext is too short")]
    Truncated,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("decrypted password is not valid utf-8")]
    Utf8,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The recipient blocked or deactivated the receiving side.
    #[error("recipient is permanently unreachable: {0}")]
    PermanentlyUnreachable(String),

    #[error("delivery failed: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transient(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
}
