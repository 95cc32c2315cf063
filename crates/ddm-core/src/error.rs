//! Error taxonomy shared by the retry engine, circuit breaker and task state
//! machine: a closed set of categories and variants, each carrying severity,
//! retryability and a context record, produced at the boundary where the
//! underlying failure is raised (transport layer, filesystem, decryptor,
//! playlist parser) rather than recovered from exception text.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse category used to select a retry policy and circuit breaker profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Filesystem,
    Authentication,
    Validation,
    Resource,
    Encryption,
    Parsing,
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Filesystem => "filesystem",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Encryption => "encryption",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::System => "system",
        };
        f.write_str(s)
    }
}

/// Severity, used to order presentation to a user-facing caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One suggested recovery action accompanying an error report.
#[derive(Debug, Clone)]
pub struct SuggestedAction {
    pub description: String,
    /// Whether the engine can perform this action itself (e.g. "retry").
    pub is_automatic: bool,
    /// 1 (do first) .. 3 (do last).
    pub priority: u8,
}

/// Closed taxonomy of domain errors (§7). Each variant maps to exactly one
/// `ErrorCategory` via `category()`.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),
    #[error("TLS certificate error: {0}")]
    TlsCertificate(String),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimit { retry_after_secs: Option<u64> },
    #[error("HTTP client error {status}")]
    Http4xx { status: u16 },
    #[error("HTTP server error {status}")]
    Http5xx { status: u16 },
    #[error("network error: {0}")]
    NetworkGeneric(String),

    #[error("permission denied: {path}")]
    Permission { path: String },
    #[error("insufficient disk space: need {required}, have {available}")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("filesystem error: {0}")]
    FilesystemGeneric(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("key fetch failed for {url}: {reason}")]
    KeyFetch { url: String, reason: String },
    #[error("decryption key invalid")]
    KeyInvalid,
    #[error("decryption failed: {0}")]
    DecryptionFailure(String),
    #[error("integrity mismatch")]
    IntegrityMismatch,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("playlist parse error: {0}")]
    PlaylistParse(String),
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    #[error("out of memory")]
    Memory,
    #[error("concurrency limit exhausted")]
    Concurrency,
    #[error("{kind} exhausted: usage {usage}, limit {limit}")]
    Exhaustion {
        kind: String,
        usage: u64,
        limit: u64,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("circuit open for host")]
    CircuitOpen,
    #[error("system error: {0}")]
    SystemGeneric(String),
}

impl DomainError {
    pub fn category(&self) -> ErrorCategory {
        use DomainError::*;
        match self {
            ConnectionTimeout
            | DnsResolution(_)
            | TlsCertificate(_)
            | Proxy(_)
            | RateLimit { .. }
            | Http4xx { .. }
            | Http5xx { .. }
            | NetworkGeneric(_) => ErrorCategory::Network,

            Permission { .. } | InsufficientSpace { .. } | NotFound { .. } | FilesystemGeneric(_) => {
                ErrorCategory::Filesystem
            }

            AuthenticationFailed => ErrorCategory::Authentication,

            KeyFetch { .. } | KeyInvalid | DecryptionFailure(_) | IntegrityMismatch => {
                ErrorCategory::Encryption
            }

            InvalidUrl(_) | PlaylistParse(_) | InvalidSegment(_) => ErrorCategory::Validation,

            Memory | Concurrency | Exhaustion { .. } => ErrorCategory::Resource,

            Configuration(_) | CircuitOpen | SystemGeneric(_) => ErrorCategory::System,
        }
    }

    /// Severity used to prioritize presentation; not itself a retry signal.
    pub fn severity(&self) -> Severity {
        use DomainError::*;
        match self {
            RateLimit { .. } | Http4xx { .. } => Severity::Low,
            ConnectionTimeout | DnsResolution(_) | Http5xx { .. } | NetworkGeneric(_)
            | NotFound { .. } | InvalidUrl(_) | PlaylistParse(_) | InvalidSegment(_) => {
                Severity::Medium
            }
            TlsCertificate(_) | Proxy(_) | Permission { .. } | KeyFetch { .. } | KeyInvalid
            | DecryptionFailure(_) | Concurrency | Configuration(_) | CircuitOpen => {
                Severity::High
            }
            AuthenticationFailed
            | InsufficientSpace { .. }
            | FilesystemGeneric(_)
            | IntegrityMismatch
            | Memory
            | Exhaustion { .. }
            | SystemGeneric(_) => Severity::Critical,
        }
    }

    /// Whether this variant is ever retryable, independent of attempt budget.
    pub fn is_retryable(&self) -> bool {
        use DomainError::*;
        !matches!(
            self,
            AuthenticationFailed
                | InvalidUrl(_)
                | PlaylistParse(_)
                | InvalidSegment(_)
                | Permission { .. }
                | NotFound { .. }
                | KeyInvalid
                | IntegrityMismatch
                | Configuration(_)
                | Memory
        )
    }

    /// Ordered, ranked recovery suggestions for user-facing reports.
    pub fn suggested_actions(&self) -> Vec<SuggestedAction> {
        use DomainError::*;
        match self {
            ConnectionTimeout | DnsResolution(_) | NetworkGeneric(_) | Http5xx { .. } => {
                vec![SuggestedAction {
                    description: "retry the request".to_string(),
                    is_automatic: true,
                    priority: 1,
                }]
            }
            RateLimit { retry_after_secs } => vec![SuggestedAction {
                description: match retry_after_secs {
                    Some(s) => format!("wait {s}s and retry"),
                    None => "back off and retry".to_string(),
                },
                is_automatic: true,
                priority: 1,
            }],
            InsufficientSpace { .. } => vec![SuggestedAction {
                description: "free disk space".to_string(),
                is_automatic: false,
                priority: 1,
            }],
            Permission { .. } => vec![SuggestedAction {
                description: "check file permissions".to_string(),
                is_automatic: false,
                priority: 1,
            }],
            KeyFetch { .. } | KeyInvalid | DecryptionFailure(_) | IntegrityMismatch => {
                vec![SuggestedAction {
                    description: "verify the stream's decryption key".to_string(),
                    is_automatic: false,
                    priority: 2,
                }]
            }
            CircuitOpen => vec![SuggestedAction {
                description: "wait for the host to recover".to_string(),
                is_automatic: true,
                priority: 1,
            }],
            _ => vec![SuggestedAction {
                description: "see logs for details".to_string(),
                is_automatic: false,
                priority: 3,
            }],
        }
    }
}

/// Context attached to every classified error for diagnostics and history.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub task_id: Option<String>,
    pub task_name: Option<String>,
    pub url: Option<String>,
    pub file_path: Option<String>,
    pub segment_index: Option<usize>,
    pub retry_count: u32,
    pub extras: Vec<(String, String)>,
}

/// A domain error plus its context, with a stricter-of hint on max retries
/// (§4.3: "the engine enforces the stricter of the two").
#[derive(Debug)]
pub struct ClassifiedError {
    pub error: DomainError,
    pub context: ErrorContext,
    pub max_retries_hint: Option<u32>,
}

impl ClassifiedError {
    pub fn new(error: DomainError, context: ErrorContext) -> Self {
        Self {
            error,
            context,
            max_retries_hint: None,
        }
    }

    pub fn with_max_retries_hint(mut self, hint: u32) -> Self {
        self.max_retries_hint = Some(hint);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    /// Human-facing report. The engine never surfaces the raw error text as a
    /// title; the category name plus the variant's `Display` impl stand in
    /// for it, and `tracing` carries the raw error for diagnostics.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.error.category(),
            severity: self.error.severity(),
            title: format!("{} error", self.error.category()),
            message: self.error.to_string(),
            actions: self.error.suggested_actions(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.error.category())
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Structured, renderer-agnostic error report (§7 "User-visible behavior").
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub actions: Vec<SuggestedAction>,
}

/// Helper used by callers assembling a jittered-delay decision: the maximum
/// of zero and `hint`, paired with the policy's own cap, whichever is lower.
pub fn stricter_max_retries(policy_max: u32, hint: Option<u32>) -> u32 {
    match hint {
        Some(h) => policy_max.min(h),
        None => policy_max,
    }
}

/// No-op placeholder kept for symmetry with `Duration`-based policy code that
/// wants a zero delay without constructing one inline everywhere.
pub const IMMEDIATE: Duration = Duration::from_secs(0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_mapping_matches_taxonomy() {
        assert_eq!(DomainError::ConnectionTimeout.category(), ErrorCategory::Network);
        assert_eq!(
            DomainError::Permission { path: "/x".into() }.category(),
            ErrorCategory::Filesystem
        );
        assert_eq!(DomainError::KeyInvalid.category(), ErrorCategory::Encryption);
        assert_eq!(
            DomainError::InvalidUrl("bad".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(DomainError::Memory.category(), ErrorCategory::Resource);
        assert_eq!(DomainError::CircuitOpen.category(), ErrorCategory::System);
    }

    #[test]
    fn non_retryable_variants() {
        assert!(!DomainError::AuthenticationFailed.is_retryable());
        assert!(!DomainError::PlaylistParse("x".into()).is_retryable());
        assert!(DomainError::ConnectionTimeout.is_retryable());
    }

    #[test]
    fn stricter_hint_wins() {
        assert_eq!(stricter_max_retries(5, Some(2)), 2);
        assert_eq!(stricter_max_retries(5, Some(9)), 5);
        assert_eq!(stricter_max_retries(5, None), 5);
    }

    #[test]
    fn classified_error_report_has_category_title() {
        let err = ClassifiedError::new(DomainError::ConnectionTimeout, ErrorContext::default());
        let report = err.report();
        assert_eq!(report.category, ErrorCategory::Network);
        assert!(report.title.contains("network"));
        assert!(!report.actions.is_empty());
    }
}
