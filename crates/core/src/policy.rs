//! Retry and freshness policies shared by the query and mutation coordinators.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::DASHBOARD_NAMESPACE;
use crate::gateway::{GatewayError, Table};

/// How long to wait before a retry.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// The same delay before every retry.
    Fixed(Duration),
    /// Delay computed from the 1-based retry number.
    Custom(fn(u32) -> Duration),
}

impl Backoff {
    /// Delay before retry number `attempt` (1 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent)
                    .map_or(max, |delay| delay.min(max))
            }
            Backoff::Fixed(delay) => delay,
            Backoff::Custom(f) => f(attempt),
        }
    }
}

/// Bounded retry with backoff and a retryable-error predicate.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use concierge_core::gateway::GatewayError;
/// use concierge_core::policy::RetryPolicy;
///
/// let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30));
/// assert_eq!(policy.delay(1), Duration::from_secs(1));
/// assert_eq!(policy.delay(3), Duration::from_secs(4));
///
/// let timeout = GatewayError::Timeout("gateway".into());
/// assert!(policy.should_retry(1, &timeout));
/// assert!(!policy.should_retry(4, &timeout));
/// assert!(!policy.should_retry(1, &GatewayError::validation("name is required")));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    retryable: fn(&GatewayError) -> bool,
}

impl RetryPolicy {
    /// Exponential backoff that retries transient gateway errors only.
    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, max },
            retryable: GatewayError::is_transient,
        }
    }

    /// Fails on the first error.
    pub fn none() -> Self {
        Self::exponential(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the retryable-error predicate.
    pub fn retry_if(mut self, retryable: fn(&GatewayError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Returns true if retry number `attempt` (1-based) should run after `error`.
    pub fn should_retry(&self, attempt: u32, error: &GatewayError) -> bool {
        attempt <= self.max_retries && (self.retryable)(error)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

impl Default for RetryPolicy {
    /// Three retries, 1s doubling up to 30s.
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Whether mounting an observer triggers a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOnMount {
    Always,
    IfStale,
    Never,
}

/// What invalidation does to matching entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationStrategy {
    /// Mark stale; the next read refetches.
    #[default]
    Mark,
    /// Mark stale and refetch every matching key that has an observer.
    Active,
}

/// Freshness, retention and retry options for one namespace.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub retain_time: Duration,
    pub refetch_on_mount: RefetchOnMount,
    pub refetch_on_focus: bool,
    pub retry: RetryPolicy,
}

impl QueryOptions {
    pub fn new(stale_time: Duration, retain_time: Duration) -> Self {
        Self {
            stale_time,
            retain_time,
            ..Self::default()
        }
    }

    pub fn refetch_on_mount(mut self, mode: RefetchOnMount) -> Self {
        self.refetch_on_mount = mode;
        self
    }

    pub fn refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = enabled;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(60),
            retain_time: Duration::from_secs(5 * 60),
            refetch_on_mount: RefetchOnMount::IfStale,
            refetch_on_focus: true,
            retry: RetryPolicy::default(),
        }
    }
}

const MINUTE: u64 = 60;

/// Namespace → options lookup with a fallback.
#[derive(Debug, Clone, Default)]
pub struct QueryConfig {
    fallback: QueryOptions,
    namespaces: HashMap<String, QueryOptions>,
}

impl QueryConfig {
    /// Only the fallback options, no per-namespace overrides.
    pub fn new(fallback: QueryOptions) -> Self {
        Self {
            fallback,
            namespaces: HashMap::new(),
        }
    }

    /// Per-namespace defaults for the property-management tables.
    ///
    /// Every namespace inherits the fallback's retry policy and focus flag.
    pub fn standard(fallback: QueryOptions) -> Self {
        let derive = |stale: u64, retain: u64| QueryOptions {
            stale_time: Duration::from_secs(stale),
            retain_time: Duration::from_secs(retain),
            ..fallback
        };

        let mut config = Self::new(fallback);
        config.set(Table::Properties.as_str(), derive(5 * MINUTE, 30 * MINUTE));
        for table in [Table::Tasks, Table::Bookings, Table::Jobs] {
            config.set(table.as_str(), derive(MINUTE, 10 * MINUTE));
        }
        for table in [Table::Invoices, Table::Expenses, Table::Commissions] {
            config.set(table.as_str(), derive(2 * MINUTE, 10 * MINUTE));
        }
        config.set(Table::Documents.as_str(), derive(5 * MINUTE, 30 * MINUTE));
        config.set(
            DASHBOARD_NAMESPACE,
            derive(30, 5 * MINUTE).refetch_on_mount(RefetchOnMount::Always),
        );
        config
    }

    /// Overrides the options of a namespace.
    pub fn set(&mut self, namespace: impl Into<String>, options: QueryOptions) {
        self.namespaces.insert(namespace.into(), options);
    }

    pub fn with(mut self, namespace: impl Into<String>, options: QueryOptions) -> Self {
        self.set(namespace, options);
        self
    }

    /// Options for a namespace, falling back to the defaults.
    pub fn options_for(&self, namespace: &str) -> &QueryOptions {
        self.namespaces.get(namespace).unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &QueryOptions {
        &self.fallback
    }
}

/// Retry policies per mutation kind.
#[derive(Debug, Clone, Copy)]
pub struct MutationPolicies {
    pub create: RetryPolicy,
    pub update: RetryPolicy,
    pub delete: RetryPolicy,
}

impl MutationPolicies {
    /// Create and update share `retry`; delete retries at most once.
    pub fn new(retry: RetryPolicy) -> Self {
        let delete = retry.with_max_retries(retry.max_retries.min(1));
        Self {
            create: retry,
            update: retry,
            delete,
        }
    }

    pub fn none() -> Self {
        Self::new(RetryPolicy::none())
    }
}

impl Default for MutationPolicies {
    fn default() -> Self {
        Self::new(RetryPolicy::exponential(
            2,
            Duration::from_secs(1),
            Duration::from_secs(30),
        ))
    }
}
