use std::time;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A cancellation signal that fires on its own once a timeout elapses.
///
/// Dropping the signal stops its timer; tokens handed out earlier are left as they are.
#[derive(Debug)]
pub struct AbortSignal {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl AbortSignal {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }
}

impl Drop for AbortSignal {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Build a signal that is cancelled after `timeout`. A zero timeout yields a signal that is
/// already cancelled.
///
/// Must be called from within a Tokio runtime.
pub fn abort_signal_after_timeout(timeout: time::Duration) -> AbortSignal {
    let token = CancellationToken::new();

    if timeout.is_zero() {
        token.cancel();
        return AbortSignal { token, timer: None };
    }

    let timer = tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        }
    });

    AbortSignal {
        token,
        timer: Some(timer),
    }
}
