// 上游重连退避：按失败类型指数增长并封顶。
use crate::relay::error::ConnectError;
use std::time::Duration;

const TRANSIENT_BASE_S: u64 = 5;
const TRANSIENT_CEILING_S: u64 = 120;
const RATE_LIMIT_BASE_S: u64 = 10;
const RATE_LIMIT_CEILING_S: u64 = 3600;

#[derive(Debug, Default, Clone)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_delay(&mut self, cause: &ConnectError) -> Duration {
        self.failures = self.failures.saturating_add(1);
        compute_delay(self.failures, cause.is_rate_limited())
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

pub fn compute_delay(failures: u32, rate_limited: bool) -> Duration {
    let (base, ceiling) = if rate_limited {
        (RATE_LIMIT_BASE_S, RATE_LIMIT_CEILING_S)
    } else {
        (TRANSIENT_BASE_S, TRANSIENT_CEILING_S)
    };
    let exponent = failures.max(1) - 1;
    let factor = 1u64.checked_shl(exponent.min(63)).unwrap_or(u64::MAX);
    let delay = base.saturating_mul(factor).min(ceiling);
    Duration::from_secs(delay)
}
