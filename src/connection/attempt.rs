use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Cancellation signal tied to one connection attempt
///
/// The token is the attempt's place in its lifecycle's monotonic sequence;
/// every suspension point races the work against cancellation so an
/// abandoned attempt stops at the next await.
#[derive(Debug, Clone)]
pub struct AttemptSignal {
    token: u64,
    cancel: CancellationToken,
}

impl AttemptSignal {
    pub fn new(token: u64) -> AttemptSignal {
        AttemptSignal {
            token,
            cancel: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` unless the attempt is cancelled first
    pub async fn select<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }
}
