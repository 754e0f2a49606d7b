//! Engine error taxonomy.

/// Errors reported by the transfer engine or its remote calls.
///
/// Events carry errors by value, so the type is `Clone` and stores
/// I/O failures as text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("node does not exist: {0}")]
    NodeDoesNotExist(String),

    #[error("storage quota exceeded")]
    StorageQuotaExceeded,

    #[error("transfer quota exceeded")]
    TransferQuotaExceeded,

    #[error("not enough quota to complete the operation")]
    NotEnoughQuota,

    #[error("node belongs to a foreign account")]
    ForeignNode,

    #[error("chat message does not exist")]
    NoSuchMessage,

    #[error("cancelled")]
    Cancelled,

    #[error("engine closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },
}

impl EngineError {
    /// The referenced local file or remote node vanished.
    pub fn is_node_missing(&self) -> bool {
        matches!(self, Self::NodeDoesNotExist(_))
    }

    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            Self::StorageQuotaExceeded | Self::TransferQuotaExceeded | Self::NotEnoughQuota
        )
    }

    pub fn is_foreign_node(&self) -> bool {
        matches!(self, Self::ForeignNode)
    }

    /// Errors that must surface once for a whole batch instead of being
    /// folded into per-item failure counts.
    pub fn is_batch_fatal(&self) -> bool {
        self.is_quota() || self.is_foreign_node()
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Self::NodeDoesNotExist(e.to_string())
        } else {
            Self::Io(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(EngineError::NodeDoesNotExist("x".into()).is_node_missing());
        assert!(EngineError::NotEnoughQuota.is_batch_fatal());
        assert!(EngineError::ForeignNode.is_batch_fatal());
        assert!(!EngineError::Cancelled.is_batch_fatal());
        assert!(!EngineError::StorageQuotaExceeded.is_node_missing());
    }

    #[test]
    fn io_not_found_maps_to_missing_node() {
        let err: EngineError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_node_missing());

        let err: EngineError = std::io::Error::other("disk").into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
