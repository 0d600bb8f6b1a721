//! Backend pool with round-robin selection, bounded retry and cooperative
//! cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::provider::{CompletionRequest, CompletionResponse, LlmError, LlmProvider};

/// Pause between a failed attempt and the next backend.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(1000);

/// Sends completion requests to a pool of backends.
///
/// The rotation index is shared by every clone of the invoker and advances on
/// both success and failure, so a failing backend is skipped on the next call
/// instead of being hit again. Concurrent callers may race on the index; that
/// only skews load distribution.
#[derive(Clone)]
pub struct ModelInvoker {
    backends: Vec<Arc<dyn LlmProvider>>,
    next: Arc<AtomicUsize>,
    max_attempts: usize,
    backoff: Duration,
}

impl std::fmt::Debug for ModelInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("ModelInvoker")
            .field("backends", &names)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl ModelInvoker {
    pub fn new(backends: Vec<Arc<dyn LlmProvider>>, max_attempts: usize) -> Self {
        Self {
            backends,
            next: Arc::new(AtomicUsize::new(0)),
            max_attempts: max_attempts.max(1),
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Same pool and rotation index, different attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Send `request`, rotating through the pool until one backend succeeds,
    /// the attempt budget runs out, or `cancel` fires.
    pub async fn invoke(
        &self,
        request: CompletionRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<CompletionResponse, LlmError> {
        if self.backends.is_empty() {
            return Err(LlmError::Unavailable("no backends configured".into()));
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                return Err(LlmError::Aborted);
            }

            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.backends.len();
            let backend = &self.backends[index];
            let call = backend.complete(request.clone());
            let result = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(LlmError::Aborted),
                    result = call => result,
                },
                None => call.await,
            };

            match result {
                Ok(response) => {
                    tracing::debug!(
                        backend = backend.name(),
                        attempt,
                        output_tokens = response.output_tokens,
                        "model call succeeded"
                    );
                    return Ok(response);
                }
                Err(LlmError::Aborted) => {
                    tracing::debug!(backend = backend.name(), attempt, "model call aborted");
                    return Err(LlmError::Aborted);
                }
                Err(e) => {
                    tracing::warn!(
                        backend = backend.name(),
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "model call failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                match cancel {
                    Some(token) => tokio::select! {
                        _ = token.cancelled() => return Err(LlmError::Aborted),
                        _ = tokio::time::sleep(self.backoff) => {}
                    },
                    None => tokio::time::sleep(self.backoff).await,
                }
            }
        }

        Err(LlmError::Exhausted { attempts: self.max_attempts, last: last_error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, ScriptedProvider};

    fn pool(providers: &[&Arc<ScriptedProvider>]) -> Vec<Arc<dyn LlmProvider>> {
        providers.iter().map(|p| Arc::clone(*p) as Arc<dyn LlmProvider>).collect()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn rotates_across_backends_on_success() {
        let a = Arc::new(ScriptedProvider::new("a").then_text("from a").then_text("from a again"));
        let b = Arc::new(ScriptedProvider::new("b").then_text("from b"));
        let invoker = ModelInvoker::new(pool(&[&a, &b]), 3);

        assert_eq!(invoker.invoke(request(), None).await.unwrap().content, "from a");
        assert_eq!(invoker.invoke(request(), None).await.unwrap().content, "from b");
        assert_eq!(invoker.invoke(request(), None).await.unwrap().content, "from a again");
        assert_eq!(a.call_count(), 2);
        assert_eq!(b.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_backend_is_skipped_by_the_retry() {
        let a = Arc::new(ScriptedProvider::new("a").then_error(LlmError::RateLimited));
        let b = Arc::new(ScriptedProvider::new("b").then_text("from b"));
        let invoker =
            ModelInvoker::new(pool(&[&a, &b]), 3).with_backoff(Duration::from_millis(1));

        let resp = invoker.invoke(request(), None).await.unwrap();
        assert_eq!(resp.content, "from b");
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_error_names_last_failure() {
        let a = Arc::new(
            ScriptedProvider::new("a")
                .then_error(LlmError::RequestFailed("boom 1".into()))
                .then_error(LlmError::RequestFailed("boom 2".into())),
        );
        let invoker = ModelInvoker::new(pool(&[&a]), 2).with_backoff(Duration::from_millis(1));

        match invoker.invoke(request(), None).await {
            Err(LlmError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(last.contains("boom 2"));
            }
            other => panic!("expected exhausted error, got {other:?}"),
        }
        assert_eq!(a.call_count(), 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_without_retry() {
        let a = Arc::new(
            ScriptedProvider::new("a")
                .then_text("too late")
                .with_delay(Duration::from_secs(5)),
        );
        let invoker = ModelInvoker::new(pool(&[&a]), 3);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = invoker.invoke(request(), Some(&token)).await;
        assert!(matches!(result, Err(LlmError::Aborted)));
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_call() {
        let a = Arc::new(ScriptedProvider::new("a").then_text("unused"));
        let invoker = ModelInvoker::new(pool(&[&a]), 3);
        let token = CancellationToken::new();
        token.cancel();

        let result = invoker.invoke(request(), Some(&token)).await;
        assert!(matches!(result, Err(LlmError::Aborted)));
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn clones_share_the_rotation_index() {
        let a = Arc::new(ScriptedProvider::new("a").then_text("from a"));
        let b = Arc::new(ScriptedProvider::new("b").then_text("from b"));
        let invoker = ModelInvoker::new(pool(&[&a, &b]), 3);
        let single = invoker.clone().with_max_attempts(1);
        assert_eq!(single.max_attempts(), 1);

        assert_eq!(invoker.invoke(request(), None).await.unwrap().content, "from a");
        assert_eq!(single.invoke(request(), None).await.unwrap().content, "from b");
    }

    #[tokio::test]
    async fn empty_pool_is_unavailable() {
        let invoker = ModelInvoker::new(vec![], 3);
        assert!(invoker.is_empty());
        let result = invoker.invoke(request(), None).await;
        assert!(matches!(result, Err(LlmError::Unavailable(_))));
    }
}
