//! Error taxonomy: typed codes, transient/permanent classification, and
//! recovery hints. Retry policy itself lives in `retry`, not here.

use thiserror::Error;

/// Stable error codes, grouped by numeric range by subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Embedding (E00x)
    EmbeddingGenerationFailed,
    EmbeddingDimensionInvalid,
    EmbeddingProviderTimeout,
    // File (E01x)
    FileNotFound,
    FileAccessDenied,
    FileEncodingError,
    // Database (E02x)
    DbConnectionFailed,
    DbQueryFailed,
    DbTransactionFailed,
    // Parameter (E03x)
    ParamInvalid,
    ParamMissing,
    ParamOutOfRange,
    QueryEmpty,
    QueryTooLong,
    // Search (E04x)
    SearchFailed,
    VectorUnavailable,
    // API/Auth (E05x)
    ApiKeyInvalid,
    LocalModelUnavailable,
    // Checkpoint (E06x)
    CheckpointCreateFailed,
    CheckpointRestoreFailed,
    CheckpointNotFound,
    // Session (E07x)
    SessionNotFound,
    // Memory ops (E08x)
    MemoryNotFound,
    MemoryConstraintViolation,
    // Validation (E09x)
    ValidationFailed,
    // Causal graph (E10x)
    GraphCycleDetected,
    // Rate/availability
    RateLimited,
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            EmbeddingGenerationFailed => "E001",
            EmbeddingDimensionInvalid => "E002",
            EmbeddingProviderTimeout => "E003",
            FileNotFound => "E010",
            FileAccessDenied => "E011",
            FileEncodingError => "E012",
            DbConnectionFailed => "E020",
            DbQueryFailed => "E021",
            DbTransactionFailed => "E022",
            ParamInvalid => "E030",
            ParamMissing => "E031",
            ParamOutOfRange => "E032",
            QueryEmpty => "E033",
            QueryTooLong => "E034",
            SearchFailed => "E040",
            VectorUnavailable => "E041",
            ApiKeyInvalid => "E050",
            LocalModelUnavailable => "E051",
            CheckpointCreateFailed => "E060",
            CheckpointRestoreFailed => "E061",
            CheckpointNotFound => "E062",
            SessionNotFound => "E070",
            MemoryNotFound => "E080",
            MemoryConstraintViolation => "E081",
            ValidationFailed => "E090",
            GraphCycleDetected => "E100",
            RateLimited => "E429",
            ServiceUnavailable => "E503",
        }
    }

    /// Whether retrying the same call may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::DbConnectionFailed
                | ErrorCode::DbQueryFailed
                | ErrorCode::EmbeddingProviderTimeout
                | ErrorCode::RateLimited
                | ErrorCode::ServiceUnavailable
        )
    }

    pub fn severity(&self) -> Severity {
        use ErrorCode::*;
        match self {
            EmbeddingDimensionInvalid | DbTransactionFailed | GraphCycleDetected => {
                Severity::Critical
            }
            DbConnectionFailed | DbQueryFailed | CheckpointRestoreFailed | ApiKeyInvalid => {
                Severity::High
            }
            FileNotFound | FileAccessDenied | SearchFailed | VectorUnavailable
            | CheckpointCreateFailed | CheckpointNotFound | MemoryNotFound => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn recovery_hint(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            EmbeddingGenerationFailed => "retry indexing; the row is left in pending status",
            EmbeddingDimensionInvalid => "the DB's dimension profile does not match the active provider; open a matching DB or re-embed into a fresh one",
            EmbeddingProviderTimeout => "retry; consider raising the provider timeout",
            FileNotFound => "check the file path still exists under an allowed root",
            FileAccessDenied => "check read permissions and the allow-listed path configuration",
            FileEncodingError => "the file is not valid UTF-8 text",
            DbConnectionFailed => "check the database path and file permissions",
            DbQueryFailed => "transient busy/locked condition; retry with backoff",
            DbTransactionFailed => "the write was fully rolled back; retry the whole operation",
            ParamInvalid | ParamMissing | ParamOutOfRange => "check the request parameters against the tool schema",
            QueryEmpty => "provide a non-empty query string",
            QueryTooLong => "shorten the query below 10000 characters",
            SearchFailed => "retry; if persistent, check memory_health for degraded subsystems",
            VectorUnavailable => "vector search is degraded; results fall back to lexical-only",
            ApiKeyInvalid => "check the configured provider API key",
            LocalModelUnavailable => "the local model/provider is not reachable",
            CheckpointCreateFailed => "a checkpoint with this name may already exist; choose another name",
            CheckpointRestoreFailed => "the snapshot may be corrupt or in an unrecognized shape",
            CheckpointNotFound => "list checkpoints to confirm the name",
            SessionNotFound => "the referenced session id is unknown",
            MemoryNotFound => "the referenced memory id does not exist",
            MemoryConstraintViolation => "a (spec_folder, file_path, anchor_id) row already exists",
            ValidationFailed => "check the validate request shape",
            GraphCycleDetected => "a related-memory relation would create a cycle",
            RateLimited => "back off and retry after a delay",
            ServiceUnavailable => "the dependent service is temporarily down; retry later",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// The single error type crossing module boundaries inside the core.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn recovery_hint(&self) -> &'static str {
        self.code.recovery_hint()
    }

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return CoreError::new(ErrorCode::MemoryConstraintViolation, err.to_string());
            }
        }
        CoreError::new(ErrorCode::DbQueryFailed, err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Transient/permanent classification for arbitrary upstream error strings,
/// as surfaced by provider HTTP clients (kept separate from the core error
/// enum so algorithms never do string matching themselves).
pub mod retry {
    /// Classify a lower-cased error message by known transient/permanent markers.
    pub fn is_transient_message(msg: &str) -> bool {
        let m = msg.to_lowercase();
        let transient_markers = [
            "sqlite_busy",
            "sqlite_locked",
            "econnreset",
            "etimedout",
            "econnrefused",
            "temporarily unavailable",
            "rate limit",
        ];
        let permanent_markers = ["unauthorized", "invalid api key", "forbidden", "access denied"];

        if permanent_markers.iter().any(|p| m.contains(p)) {
            return false;
        }
        transient_markers.iter().any(|p| m.contains(p))
    }

    /// Simple exponential backoff schedule in milliseconds, capped.
    pub fn backoff_schedule(max_attempts: u32) -> Vec<u64> {
        (0..max_attempts)
            .map(|attempt| (100u64 << attempt).min(5_000))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_detects_known_markers() {
        assert!(retry::is_transient_message("SQLITE_BUSY: database is locked"));
        assert!(retry::is_transient_message("connection reset (ECONNRESET)"));
        assert!(!retry::is_transient_message("401 Unauthorized"));
        assert!(!retry::is_transient_message("access denied for this resource"));
    }

    #[test]
    fn codes_have_distinct_strings() {
        let codes = [
            ErrorCode::EmbeddingDimensionInvalid,
            ErrorCode::DbQueryFailed,
            ErrorCode::QueryEmpty,
            ErrorCode::RateLimited,
        ];
        let mut seen = std::collections::HashSet::new();
        for c in codes {
            assert!(seen.insert(c.as_str()));
        }
    }

    #[test]
    fn sqlite_constraint_violation_maps_to_memory_constraint_violation() {
        let sqlite_err = rusqlite::ffi::Error { code: rusqlite::ffi::ErrorCode::ConstraintViolation, extended_code: rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE };
        let err: CoreError = rusqlite::Error::SqliteFailure(sqlite_err, Some("UNIQUE constraint failed".into())).into();
        assert_eq!(err.code, ErrorCode::MemoryConstraintViolation);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let sched = retry::backoff_schedule(6);
        for pair in sched.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(*sched.last().unwrap() <= 5_000);
    }
}
