//! Single-shot completion callbacks.

use std::fmt;

type CallbackFn = Box<dyn FnOnce(bool) + Send + 'static>;

/// A completion callback that runs exactly once.
///
/// `run` consumes the callback. If it is dropped without running, for
/// example because the owning pipeline or context was torn down, it runs
/// with `false` from `Drop`, so a request is never silently lost.
pub struct ReadbackCallback {
    inner: Option<CallbackFn>,
}

impl ReadbackCallback {
    pub fn new(callback: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(callback)),
        }
    }

    /// Invoke the callback with the given success flag.
    pub fn run(mut self, success: bool) {
        if let Some(callback) = self.inner.take() {
            callback(success);
        }
    }
}

impl Drop for ReadbackCallback {
    fn drop(&mut self) {
        if let Some(callback) = self.inner.take() {
            callback(false);
        }
    }
}

impl<F> From<F> for ReadbackCallback
where
    F: FnOnce(bool) + Send + 'static,
{
    fn from(callback: F) -> Self {
        Self::new(callback)
    }
}

impl fmt::Debug for ReadbackCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadbackCallback")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting() -> (ReadbackCallback, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ok = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let (o, f) = (ok.clone(), failed.clone());
        let cb = ReadbackCallback::new(move |success| {
            if success {
                o.fetch_add(1, Ordering::SeqCst);
            } else {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        (cb, ok, failed)
    }

    #[test]
    fn test_run_fires_once() {
        let (cb, ok, failed) = counting();
        cb.run(true);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_reports_failure() {
        let (cb, ok, failed) = counting();
        drop(cb);
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}
