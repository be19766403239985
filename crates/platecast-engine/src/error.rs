use serde_json::Value;

const MESSAGE_MAX_CHARS: usize = 512;

const CONTENT_POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content policy",
    "content_filter",
    "moderation",
    "safety system",
    "data_inspection_failed",
    "sensitive content",
    "sensitive_content",
    "risk control",
];

const OVERLOAD_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests", "overloaded"];

/// Failure of one provider call.
///
/// Variants are split along the lines callers act on: only
/// [`ProviderError::RateLimited`] is worth another attempt, configuration and
/// signing problems are raised before any request leaves the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} is not configured: {message}")]
    Config { provider: String, message: String },
    #[error("{provider} token signing failed: {message}")]
    Signing { provider: String, message: String },
    #[error("{provider} rejected the credential ({status}): {message}")]
    Unauthorized {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} is rate limited{}: {message}", status_suffix(.status))]
    RateLimited {
        provider: String,
        status: Option<u16>,
        message: String,
    },
    #[error("{provider} request failed ({status}): {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} {}: {message}", transport_verb(.timed_out))]
    Transport {
        provider: String,
        message: String,
        timed_out: bool,
    },
    #[error("{provider} returned an unusable response: {message}")]
    Malformed { provider: String, message: String },
    #[error("{provider} declined the request (content policy): {message}")]
    ContentPolicy { provider: String, message: String },
    #[error("{provider} task {task_id} failed: {message}")]
    TaskFailed {
        provider: String,
        task_id: String,
        message: String,
    },
    #[error("{provider} task {task_id} did not finish after {attempts} polls")]
    PollTimeout {
        provider: String,
        task_id: String,
        attempts: u32,
    },
}

impl ProviderError {
    pub fn config(provider: &str, message: impl Into<String>) -> Self {
        Self::Config {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(provider: &str, message: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Config { provider, .. }
            | Self::Signing { provider, .. }
            | Self::Unauthorized { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::Http { provider, .. }
            | Self::Transport { provider, .. }
            | Self::Malformed { provider, .. }
            | Self::ContentPolicy { provider, .. }
            | Self::TaskFailed { provider, .. }
            | Self::PollTimeout { provider, .. } => provider,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::RateLimited { status, .. } => *status,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Signing { .. } => "signing",
            Self::Unauthorized { .. } => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::Http { .. } => "http",
            Self::Transport { .. } => "transport",
            Self::Malformed { .. } => "malformed",
            Self::ContentPolicy { .. } => "content_policy",
            Self::TaskFailed { .. } => "task_failed",
            Self::PollTimeout { .. } => "poll_timeout",
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Configuration, signing, and credential errors never succeed on retry.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::Signing { .. } | Self::Unauthorized { .. }
        )
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

fn transport_verb(timed_out: &bool) -> &'static str {
    if *timed_out {
        "request timed out"
    } else {
        "request could not be sent"
    }
}

/// Maps a non-2xx reply onto the error taxonomy.
pub fn classify_failure(provider: &str, status: u16, body: &str) -> ProviderError {
    let message = provider_message(body);
    let lowered = body.to_ascii_lowercase();
    let provider = provider.to_string();
    match status {
        429 | 503 => ProviderError::RateLimited {
            provider,
            status: Some(status),
            message,
        },
        401 | 403 => ProviderError::Unauthorized {
            provider,
            status,
            message,
        },
        _ if contains_any(&lowered, CONTENT_POLICY_MARKERS) => {
            ProviderError::ContentPolicy { provider, message }
        }
        _ if contains_any(&lowered, OVERLOAD_MARKERS) => ProviderError::RateLimited {
            provider,
            status: Some(status),
            message,
        },
        _ => ProviderError::Http {
            provider,
            status,
            message,
        },
    }
}

/// Best-effort extraction of the human-readable message from an error body.
pub fn provider_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        let candidates = [
            parsed.pointer("/error/message"),
            parsed.get("message"),
            parsed.get("msg"),
            parsed.get("error"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(text) = candidate.as_str().map(str::trim).filter(|v| !v.is_empty()) {
                return truncate_text(text, MESSAGE_MAX_CHARS);
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    truncate_text(trimmed, MESSAGE_MAX_CHARS)
}

pub fn looks_like_content_policy(text: &str) -> bool {
    contains_any(&text.to_ascii_lowercase(), CONTENT_POLICY_MARKERS)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_overload_statuses_are_retryable_class() {
        let err = classify_failure("deepseek", 429, r#"{"error":{"message":"slow down"}}"#);
        assert!(err.is_rate_limited());
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.to_string(), "deepseek is rate limited (429): slow down");

        assert!(classify_failure("siliconflow", 503, "busy").is_rate_limited());
        assert!(classify_failure("kling", 400, r#"{"message":"Too many requests"}"#)
            .is_rate_limited());
    }

    #[test]
    fn credential_failures_are_fatal() {
        let err = classify_failure("openai", 401, r#"{"error":{"message":"bad key"}}"#);
        assert!(matches!(err, ProviderError::Unauthorized { status: 401, .. }));
        assert!(err.is_fatal_setup());
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn content_policy_rejection_is_distinguished_from_plain_http_errors() {
        let err = classify_failure(
            "openai",
            400,
            r#"{"error":{"code":"content_policy_violation","message":"rejected by safety system"}}"#,
        );
        assert_eq!(err.kind(), "content_policy");
        assert_eq!(
            err.to_string(),
            "openai declined the request (content policy): rejected by safety system"
        );

        let err = classify_failure("openai", 400, r#"{"error":{"message":"bad size"}}"#);
        assert_eq!(err.kind(), "http");

        let err = classify_failure(
            "siliconflow",
            400,
            r#"{"error":{"message":"model name is case-sensitive"}}"#,
        );
        assert_eq!(err.kind(), "http");
        let err = classify_failure(
            "siliconflow",
            400,
            r#"{"message":"prompt contains sensitive content"}"#,
        );
        assert_eq!(err.kind(), "content_policy");
    }

    #[test]
    fn provider_message_falls_back_to_truncated_body() {
        assert_eq!(provider_message("   "), "empty response body");
        let long = "x".repeat(600);
        let message = provider_message(&long);
        assert_eq!(message.chars().count(), MESSAGE_MAX_CHARS + 1);
        assert!(message.ends_with('…'));
    }
}
