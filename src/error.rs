use std::path::PathBuf;

/// Unified error type for registry-mutating entry points.
///
/// Per-record analysis never returns an error (unresolvable addresses or
/// access kinds are counted and skipped, see [`crate::metrics`]); this type
/// only surfaces from the coarse-grained, rarely-called registration API.
#[derive(thiserror::Error, Debug)]
pub enum RedshowError {
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("callback not registered: {0}")]
    CallbackNotRegistered(&'static str),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to analyze cubin: {0}")]
    CubinParseFailed(#[source] anyhow::Error),

    #[error("corrupt trace buffer: {0}")]
    CorruptBuffer(String),
}

pub type Result<T> = std::result::Result<T, RedshowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_formats_with_context() {
        let err = RedshowError::Duplicate("cubin_id=3".to_string());
        assert_eq!(err.to_string(), "duplicate entry: cubin_id=3");
    }

    #[test]
    fn cubin_parse_failed_carries_source() {
        let source = anyhow::anyhow!("unexpected token at line 4");
        let err = RedshowError::CubinParseFailed(source);
        assert!(err.to_string().contains("failed to analyze cubin"));
    }
}
