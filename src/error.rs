use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Closed error taxonomy for the validation pipeline.
///
/// Every variant maps to an issue kind or error classification the
/// scheduler's retry/escalation rules key off: `is_retryable` drives inline
/// retry, `severity` drives logging and alerting.
#[derive(Debug, Clone, Error)]
pub enum ValidatorError {
    #[error("browser instance unavailable")]
    BrowserUnavailable,

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("browser process died: {0}")]
    BrowserProcessDied(String),

    #[error("page crashed: {0}")]
    PageCrashed(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("datastore error: {0}")]
    DatastoreError(String),

    #[error("page error: {0}")]
    PageError(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("semaphore acquire error: {0}")]
    SemaphoreError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("lock held by another process: pid {0}")]
    LockHeld(u32),
}

impl ValidatorError {
    /// Retryable inline (spec §7 "Retryable (inline)"): transport timeouts,
    /// connection-refused/reset, 5xx, page-crashed. Navigation/event-wait
    /// *timeouts* are deliberately excluded here — the scheduler always
    /// escalates those to Phase 2 rather than retrying them inline.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ValidatorError::BrowserUnavailable
                | ValidatorError::NavigationFailed(_)
                | ValidatorError::NetworkError(_)
                | ValidatorError::PageCrashed(_)
                | ValidatorError::PageError(_)
                | ValidatorError::BrowserProcessDied(_)
        )
    }

    /// Non-retryable inline errors are surfaced as `VALIDATION_ERROR`.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ValidatorError::InvalidUrl(_)
                | ValidatorError::ConfigurationError(_)
                | ValidatorError::ValidationError(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ValidatorError::InvalidUrl(_) => ErrorSeverity::Low,
            ValidatorError::ElementNotFound(_) => ErrorSeverity::Low,
            ValidatorError::ConfigurationError(_) => ErrorSeverity::High,
            ValidatorError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            ValidatorError::LockHeld(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Guards the Batch Uploader's tolerance for sustained transport failures;
/// same role it plays around browser acquisition in the teacher.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: std::sync::Arc<std::sync::Mutex<CircuitState>>,
    failure_threshold: usize,
    recovery_timeout: Duration,
    failure_count: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    last_failure_time: std::sync::Arc<std::sync::Mutex<Option<std::time::Instant>>>,
}

#[derive(Debug, Clone, Copy)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            state: std::sync::Arc::new(std::sync::Mutex::new(CircuitState::Closed)),
            failure_threshold,
            recovery_timeout,
            failure_count: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            last_failure_time: std::sync::Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn can_execute(&self) -> bool {
        let state = *self.state.lock().unwrap();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = *self.last_failure_time.lock().unwrap() {
                    if last_failure.elapsed() > self.recovery_timeout {
                        *self.state.lock().unwrap() = CircuitState::HalfOpen;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        self.failure_count
            .store(0, std::sync::atomic::Ordering::Relaxed);
        *self.state.lock().unwrap() = CircuitState::Closed;
        *self.last_failure_time.lock().unwrap() = None;
    }

    pub fn record_failure(&self) {
        let failures = self
            .failure_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        *self.last_failure_time.lock().unwrap() = Some(std::time::Instant::now());

        if failures >= self.failure_threshold {
            *self.state.lock().unwrap() = CircuitState::Open;
        }
    }

    pub fn get_state(&self) -> CircuitState {
        *self.state.lock().unwrap()
    }

    pub fn get_failure_count(&self) -> usize {
        self.failure_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl From<AcquireError> for ValidatorError {
    fn from(err: AcquireError) -> Self {
        ValidatorError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for ValidatorError {
    fn from(err: std::io::Error) -> Self {
        ValidatorError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ValidatorError {
    fn from(err: serde_json::Error) -> Self {
        ValidatorError::SerializationError(err.to_string())
    }
}

impl From<sqlx::Error> for ValidatorError {
    fn from(err: sqlx::Error) -> Self {
        ValidatorError::DatastoreError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ValidatorError::BrowserUnavailable.is_retryable());
        assert!(ValidatorError::NetworkError("x".into()).is_retryable());
        assert!(!ValidatorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ValidatorError::InvalidUrl("x".into()).is_retryable());
        assert!(!ValidatorError::ConfigurationError("x".into()).is_retryable());
    }

    #[test]
    fn configuration_error_classification() {
        assert!(ValidatorError::InvalidUrl("x".into()).is_configuration_error());
        assert!(!ValidatorError::NetworkError("x".into()).is_configuration_error());
    }

    #[test]
    fn circuit_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.can_execute());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert!(breaker.can_execute());
        assert_eq!(breaker.get_failure_count(), 0);
    }
}
