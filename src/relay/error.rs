// 中继错误类型：面向调用方的错误与连接失败分类。
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("server misconfigured: {0}")]
    Configuration(String),
    #[error("missing channel handle")]
    InvalidChannel,
    #[error("unsupported platform: {0}")]
    UnknownPlatform(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidChannel => "INVALID_CHANNEL",
            Self::UnknownPlatform(_) => "UNKNOWN_PLATFORM",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("connect failed: {0}")]
    Transient(String),
    #[error("non-retryable: {0}")]
    Fatal(String),
}

impl ConnectError {
    pub fn from_reason(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let lowered = reason.to_ascii_lowercase();
        if lowered.contains("rate_limit") || lowered.contains("rate limit") {
            Self::RateLimited(reason)
        } else {
            Self::Transient(reason)
        }
    }

    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match status {
            429 => Self::RateLimited(reason),
            401 | 403 | 404 => Self::Fatal(reason),
            _ => Self::from_reason(reason),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
