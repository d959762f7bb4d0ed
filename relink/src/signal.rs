use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

/// One-shot abort signal. Any number of holders may fire it; only the first
/// call has an effect.
#[derive(Clone, Default)]
pub(crate) struct AbortSignal {
    inner: Arc<Inner>,
}

impl AbortSignal {
    /// Fire the signal. Returns `true` for the call that actually fired it.
    pub(crate) fn fire(&self) -> bool {
        let first = self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Resolves once the signal has fired.
    pub(crate) async fn fired(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}
