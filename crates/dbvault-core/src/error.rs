use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("database engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("no base backup to chain from: {0}")]
    NoBaseBackup(String),

    #[error("point in time not covered: {0}")]
    NoCoverage(String),

    #[error("integrity violation for '{key}': expected {expected}, got {actual}")]
    IntegrityViolation {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database is locked by another run ({0})")]
    Locked(String),

    #[error("no new replay entries since the previous backup")]
    NoNewEntries,

    #[error("backup not found: '{0}'")]
    BackupNotFound(String),

    #[error("artifact missing from storage: '{0}'")]
    ArtifactMissing(String),

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("unknown encryption key id: '{0}'")]
    UnknownKey(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("{tool} exited with status {code}: {stderr}")]
    Engine {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl VaultError {
    /// Whether a scheduler may retry the run that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VaultError::EngineUnreachable(_)
                | VaultError::StorageUnavailable(_)
                | VaultError::Locked(_)
        )
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::EngineUnreachable(_) => "engine_unreachable",
            VaultError::UnsupportedOperation(_) => "unsupported_operation",
            VaultError::NoBaseBackup(_) => "no_base_backup",
            VaultError::NoCoverage(_) => "no_coverage",
            VaultError::IntegrityViolation { .. } => "integrity_violation",
            VaultError::StorageUnavailable(_) => "storage_unavailable",
            VaultError::Cancelled => "cancelled",
            VaultError::Locked(_) => "locked",
            VaultError::NoNewEntries => "no_new_entries",
            VaultError::BackupNotFound(_) => "backup_not_found",
            VaultError::ArtifactMissing(_) => "artifact_missing",
            VaultError::DecryptionFailed => "decryption_failed",
            VaultError::UnknownKey(_) => "unknown_key",
            VaultError::Decompression(_) | VaultError::UnknownCompressionTag(_) => {
                "decompression"
            }
            VaultError::Engine { .. } => "engine",
            VaultError::Catalog(_) => "catalog",
            VaultError::Config(_) => "config",
            VaultError::InvalidFormat(_) => "invalid_format",
            VaultError::Json(_) => "json",
            VaultError::Io(_) => "io",
            VaultError::Other(_) => "other",
        }
    }

    /// Human-readable reason persisted on failed records.
    pub fn failure_reason(&self) -> String {
        format!("{}: {self}", self.kind())
    }

    /// Unwrap an `io::Error` that carries a `VaultError` raised inside a
    /// `Read`/`Write` adapter back into the original variant.
    pub fn from_io(err: std::io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<VaultError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(vault) = inner.downcast::<VaultError>() {
                    return *vault;
                }
            }
            return VaultError::Other("lost wrapped error".into());
        }
        VaultError::Io(err)
    }

    /// Wrap this error in an `io::Error` so it can cross `Read`/`Write` boundaries.
    pub fn into_io(self) -> std::io::Error {
        match self {
            VaultError::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(VaultError::EngineUnreachable("refused".into()).is_transient());
        assert!(VaultError::StorageUnavailable("503".into()).is_transient());
        assert!(VaultError::Locked("backup".into()).is_transient());
        assert!(!VaultError::NoBaseBackup("db".into()).is_transient());
        assert!(!VaultError::Cancelled.is_transient());
    }

    #[test]
    fn io_wrapping_preserves_variant() {
        let io = VaultError::DecryptionFailed.into_io();
        assert!(matches!(VaultError::from_io(io), VaultError::DecryptionFailed));

        let plain = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(VaultError::from_io(plain), VaultError::Io(_)));
    }

    #[test]
    fn failure_reason_leads_with_kind() {
        let reason = VaultError::NoNewEntries.failure_reason();
        assert!(reason.starts_with("no_new_entries: "));
    }
}
