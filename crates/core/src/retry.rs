use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::conversation::{ChatError, ChatModel, Conversation};
use crate::exchange::ExchangeLog;
use crate::logging::{LogLevel, LogRecord, LogSink};

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Fixed-delay retry policy: `max_attempts` tries in total, `delay` between two tries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

#[derive(Debug, Error)]
#[error("no reply after {attempts} attempts: {source}")]
pub struct ExhaustedRetries {
    pub attempts: usize,
    #[source]
    pub source: ChatError,
}

/// Wraps a single backend call with bounded retries and records successful exchanges.
pub struct RetryController<'a> {
    model: &'a dyn ChatModel,
    sink: &'a dyn LogSink,
    policy: RetryPolicy,
    exchange_log: Option<ExchangeLog>,
}

impl<'a> RetryController<'a> {
    pub fn new(model: &'a dyn ChatModel, sink: &'a dyn LogSink) -> Self {
        Self {
            model,
            sink,
            policy: RetryPolicy::default(),
            exchange_log: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_exchange_log(mut self, log: ExchangeLog) -> Self {
        self.exchange_log = Some(log);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn exchange_log(&self) -> Option<&ExchangeLog> {
        self.exchange_log.as_ref()
    }

    pub fn execute(&self, conversation: &Conversation) -> Result<String, ExhaustedRetries> {
        let attempts = self.policy.attempts();
        let mut last_error: Option<ChatError> = None;

        for attempt in 1..=attempts {
            match self.model.send(conversation) {
                Ok(reply) => {
                    self.record(conversation, &reply);
                    return Ok(reply);
                }
                Err(err) => {
                    self.log(
                        LogLevel::Warn,
                        format!("request attempt {attempt}/{attempts} failed: {err}"),
                    );
                    if attempt < attempts {
                        thread::sleep(self.policy.delay);
                    }
                    last_error = Some(err);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| ChatError::backend("no attempt was made"));
        Err(ExhaustedRetries { attempts, source })
    }

    fn record(&self, conversation: &Conversation, reply: &str) {
        let Some(log) = &self.exchange_log else {
            return;
        };
        if let Err(err) = log.append(conversation, reply) {
            self.log(
                LogLevel::Warn,
                format!(
                    "could not append to exchange log `{}`: {err}",
                    log.path().display()
                ),
            );
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use crate::exchange::count_records;
    use crate::logging::VecLogSink;
    use std::fs;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::tempdir;

    struct FlakyModel {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyModel {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ChatModel for FlakyModel {
        fn send(&self, _conversation: &Conversation) -> Result<String, ChatError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if call % 2 == 0 {
                    Err(ChatError::transport(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    )))
                } else {
                    Err(ChatError::backend("malformed body"))
                }
            } else {
                Ok("the reply".to_string())
            }
        }
    }

    fn conversation() -> Conversation {
        [Message::system("rules"), Message::user("go")].into_iter().collect()
    }

    #[test]
    fn recovers_after_transient_failures() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("log.txt");
        let model = FlakyModel::new(3);
        let sink = VecLogSink::new();
        let controller = RetryController::new(&model, &sink)
            .with_policy(RetryPolicy::new(5, Duration::from_millis(1)))
            .with_exchange_log(ExchangeLog::new(&log_path));

        let reply = controller.execute(&conversation()).unwrap();

        assert_eq!(reply, "the reply");
        assert_eq!(model.calls(), 4);
        assert_eq!(sink.count(LogLevel::Warn), 3);
        let contents = fs::read_to_string(&log_path).unwrap();
        assert_eq!(count_records(&contents), 1);
    }

    #[test]
    fn gives_up_after_max_attempts_with_fixed_delay() {
        let model = FlakyModel::new(usize::MAX);
        let sink = VecLogSink::new();
        let delay = Duration::from_millis(20);
        let controller =
            RetryController::new(&model, &sink).with_policy(RetryPolicy::new(4, delay));

        let started = Instant::now();
        let err = controller.execute(&conversation()).unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.attempts, 4);
        assert_eq!(model.calls(), 4);
        assert!(elapsed >= delay * 3, "elapsed {elapsed:?}");
        assert!(matches!(err.source, ChatError::Backend(_)));
        assert!(err.to_string().starts_with("no reply after 4 attempts"));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let model = FlakyModel::new(0);
        let sink = VecLogSink::new();
        let controller =
            RetryController::new(&model, &sink).with_policy(RetryPolicy::new(0, Duration::ZERO));

        assert_eq!(controller.execute(&conversation()).unwrap(), "the reply");
        assert_eq!(model.calls(), 1);
    }

    #[test]
    fn unwritable_exchange_log_does_not_abort() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened for appending.
        let model = FlakyModel::new(0);
        let sink = VecLogSink::new();
        let controller = RetryController::new(&model, &sink)
            .with_policy(RetryPolicy::new(1, Duration::ZERO))
            .with_exchange_log(ExchangeLog::new(dir.path()));

        assert_eq!(controller.execute(&conversation()).unwrap(), "the reply");
        assert!(sink.contains(LogLevel::Warn, "could not append to exchange log"));
    }
}
