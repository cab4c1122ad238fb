use thiserror::Error;

/// Failure classification persisted into a job's `error_message`.
///
/// The string forms are part of the external contract: status readers
/// match on the `<KIND>: <detail>` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    DbConnect,
    DbExecute,
    ExportFormat,
    ExportIo,
    SshAuth,
    SshConnect,
    SshTransfer,
    Timeout,
    Canceled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::DbConnect => "DB_CONNECT",
            Self::DbExecute => "DB_EXECUTE",
            Self::ExportFormat => "EXPORT_FORMAT",
            Self::ExportIo => "EXPORT_IO",
            Self::SshAuth => "SSH_AUTH",
            Self::SshConnect => "SSH_CONNECT",
            Self::SshTransfer => "SSH_TRANSFER",
            Self::Timeout => "TIMEOUT",
            Self::Canceled => "CANCELED",
            Self::Internal => "INTERNAL",
        }
    }
}

/// A classified job failure, caught at the worker boundary and written
/// to the row as `failed`.
#[derive(Debug, Clone, Error)]
#[error("{}: {detail}", kind.as_str())]
pub struct JobError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "job was canceled")
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }
}

/// Strips credential material from an error string before it is logged
/// or persisted. Matching is plain substring replacement; empty and
/// very short secrets are skipped so we do not shred unrelated text.
pub fn redact_secrets(message: &str, secrets: &[Option<&str>]) -> String {
    let mut redacted = message.to_string();
    for secret in secrets.iter().flatten() {
        let secret = secret.trim();
        if secret.len() < 3 {
            continue;
        }
        redacted = redacted.replace(secret, "***");
    }
    redacted
}
