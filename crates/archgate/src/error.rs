use std::path::PathBuf;

/// Errors the fix engine reports to callers that must distinguish a blocked
/// edit from plumbing failures.
#[derive(Debug, thiserror::Error)]
pub enum FixError {
    #[error("semantic block: {file}: {reason}")]
    SemanticBlock { file: String, reason: String },

    #[error("fix io: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FixError {
    pub fn semantic_block(file: impl Into<String>, reason: impl Into<String>) -> Self {
        FixError::SemanticBlock {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("no signing key configured (set ARCHGATE_SIGNING_KEY or signing_key_file)")]
    MissingKey,

    #[error("certificate is malformed: {0}")]
    Malformed(String),

    #[error("certificate signature does not match its contents")]
    BadSignature,
}
