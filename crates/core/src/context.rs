use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StrataError;

/// Cancellable, deadline-bound execution context passed to long-running calls.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// Never cancelled unless `cancel` is called; no deadline.
    pub fn background() -> Self {
        Self { token: CancellationToken::new(), deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { token: CancellationToken::new(), deadline: Some(Instant::now() + timeout) }
    }

    /// Child context: cancelled with its parent, deadline never later than the parent's.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }

    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = Some(self.deadline.map_or(own, |d| d.min(own)));
        Self { token: self.token.child_token(), deadline }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Error describing why the context ended, if it has.
    pub fn err(&self) -> Option<StrataError> {
        if self.token.is_cancelled() {
            Some(StrataError::Transport("cancelled".into()))
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(StrataError::Transport("deadline exceeded".into()))
        } else {
            None
        }
    }

    /// Fail fast if the context already ended.
    pub fn check(&self) -> Result<(), StrataError> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drive `fut` until it completes or the context ends, whichever comes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, StrataError>
    where
        F: Future<Output = Result<T, StrataError>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            res = fut => res,
            _ = self.token.cancelled() => Err(StrataError::Transport("cancelled".into())),
            _ = deadline => Err(StrataError::Transport("deadline exceeded".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_wins_over_slow_future() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        let res: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(res.unwrap_err(), StrataError::Transport("deadline exceeded".into()));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_done());
        assert_eq!(child.check().unwrap_err(), StrataError::Transport("cancelled".into()));
    }

    #[tokio::test]
    async fn completes_before_deadline() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);
        let child = ctx.child_with_timeout(Duration::from_secs(60));
        assert!(child.deadline() <= ctx.deadline());
    }
}
