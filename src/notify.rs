//! Script completion notifications

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::script::ScriptResult;

pub type NotifyError = Box<dyn std::error::Error + Send + Sync>;

/// Receives the result of every script run
///
/// Failures returned (or panics raised) here are logged and dropped; they
/// never reach the queue or delay the next webhook beyond the call itself.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, result: ScriptResult) -> Result<(), NotifyError>;
}

/// Default notifier: writes a summary of each script run to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, result: ScriptResult) -> Result<(), NotifyError> {
        if result.failed {
            warn!(
                script = %result.script.display(),
                exit_code = ?result.exit_code,
                error = ?result.error,
                "Script failed:\n{}",
                result.combined_output
            );
        } else {
            info!(
                script = %result.script.display(),
                duration_ms = result.duration.as_millis() as u64,
                "Script succeeded:\n{}",
                result.combined_output
            );
        }
        Ok(())
    }
}

/// Hands `result` to `notifier`, swallowing any error or panic it raises.
pub async fn notify_best_effort(notifier: Arc<dyn Notifier>, result: ScriptResult) {
    let script = result.script.clone();
    let outcome = tokio::spawn(async move { notifier.notify(result).await }).await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Notifier failed for {:?}: {}", script, e),
        Err(e) => warn!("Notifier panicked for {:?}: {}", script, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    fn result(script: &str) -> ScriptResult {
        ScriptResult {
            script: PathBuf::from(script),
            failed: false,
            error: None,
            exit_code: Some(0),
            combined_output: "ok\n".to_string(),
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            started_at: Utc::now(),
            duration: Duration::from_millis(5),
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<PathBuf>>);

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, result: ScriptResult) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(result.script);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _result: ScriptResult) -> Result<(), NotifyError> {
            Err("notification endpoint unreachable".into())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Notifier for Panicking {
        async fn notify(&self, _result: ScriptResult) -> Result<(), NotifyError> {
            panic!("notifier bug");
        }
    }

    #[tokio::test]
    async fn delivers_result_once() {
        let recording = Arc::new(Recording::default());
        notify_best_effort(recording.clone(), result("push.sh")).await;

        assert_eq!(*recording.0.lock().unwrap(), vec![PathBuf::from("push.sh")]);
    }

    #[tokio::test]
    async fn swallows_notifier_errors_and_panics() {
        notify_best_effort(Arc::new(Failing), result("push.sh")).await;
        notify_best_effort(Arc::new(Panicking), result("push.sh")).await;
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        assert!(LogNotifier.notify(result("push.sh")).await.is_ok());
    }
}
