use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Error taxonomy for the agent core. Each variant maps to one of the
/// propagation rules in the error-handling design: transient errors get
/// retried by the dispatcher, per-task errors are recorded onto the task's
/// result rather than aborting the job, and `Fatal` unwinds through shutdown.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("job malformed: {0}")]
    JobMalformed(String),

    #[error("driver launch failed: {0}")]
    DriverLaunch(String),

    #[error("page load timeout after {0:?}")]
    LoadTimeout(Duration),

    #[error("request count exceeded limit")]
    RequestOverflow,

    #[error("result upload failed: {0}")]
    UploadFailed(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl AgentError {
    /// TransientNetwork and LoadTimeout are worth retrying; everything else
    /// is either a permanent condition (JobMalformed) or already terminal
    /// (Fatal).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::TransientNetwork(_) | AgentError::LoadTimeout(_) | AgentError::UploadFailed(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AgentError::JobMalformed(_) => ErrorSeverity::Low,
            AgentError::RequestOverflow => ErrorSeverity::Low,
            AgentError::LoadTimeout(_) => ErrorSeverity::Medium,
            AgentError::UploadFailed(_) => ErrorSeverity::Medium,
            AgentError::DriverLaunch(_) => ErrorSeverity::High,
            AgentError::Fatal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Numeric page_data.result codes used by RunController / ArtifactProcessor.
    pub fn result_code(&self) -> Option<i32> {
        match self {
            AgentError::DriverLaunch(_) => Some(12999),
            AgentError::LoadTimeout(_) => Some(99998),
            AgentError::RequestOverflow => Some(99997),
            _ => None,
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

/// Gates retries for both job acquisition and result upload. Three
/// consecutive failures opens the breaker; after `recovery_timeout` it
/// allows one trial request through (half-open) before fully closing again.
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

impl From<AcquireError> for AgentError {
    fn from(err: AcquireError) -> Self {
        AgentError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(AgentError::TransientNetwork("x".into()).is_retryable());
        assert!(AgentError::LoadTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!AgentError::JobMalformed("x".into()).is_retryable());
        assert!(!AgentError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn result_codes() {
        assert_eq!(AgentError::LoadTimeout(Duration::from_secs(1)).result_code(), Some(99998));
        assert_eq!(AgentError::RequestOverflow.result_code(), Some(99997));
        assert_eq!(AgentError::DriverLaunch("x".into()).result_code(), Some(12999));
        assert_eq!(AgentError::JobMalformed("x".into()).result_code(), None);
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
