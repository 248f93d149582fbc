//! Storage engine error types.

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("out of storage space: requested {requested} segments")]
    OutOfSpace { requested: u64 },

    #[error("segment {segment_id} read failed")]
    SegmentReadFailed { segment_id: u32 },

    #[error("segment {segment_id} write failed on disk {disk}")]
    SegmentWriteFailed { segment_id: u32, disk: usize },

    #[error("chain linkage inconsistent: {0}")]
    ChainLinkageInconsistent(String),

    #[error("session invalid: {0}")]
    SessionInvalid(&'static str),

    #[error("bundle not fully read prior to removal")]
    BundleNotRead,

    #[error("segment {segment_id} double free")]
    DoubleFree { segment_id: u32 },

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("bundle decode error during restore: {0}")]
    Bundle(#[from] bpn_core::BundleError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_non_empty() {
        let variants: Vec<StorageError> = vec![
            StorageError::OutOfSpace { requested: 12 },
            StorageError::SegmentReadFailed { segment_id: 3 },
            StorageError::SegmentWriteFailed {
                segment_id: 3,
                disk: 1,
            },
            StorageError::ChainLinkageInconsistent("next id mismatch".into()),
            StorageError::SessionInvalid("no chain popped"),
            StorageError::BundleNotRead,
            StorageError::DoubleFree { segment_id: 9 },
            StorageError::RestoreFailed("segment already allocated".into()),
        ];
        for v in &variants {
            assert!(!v.to_string().is_empty(), "{v:?} should have non-empty Display");
        }
    }
}
