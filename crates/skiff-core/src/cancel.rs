use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cooperative cancellation flag shared between the party that requests
/// cancellation and the work being cancelled.
///
/// Backed by a Mutex+Condvar pair so timed waits (retry backoff) wake
/// immediately when the token fires instead of sleeping out the delay.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut flag = self.inner.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        *flag = true;
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `duration` unless cancelled first.
    /// Returns `true` if the token fired during (or before) the wait.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut flag = self.inner.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + duration;
        while !*flag {
            let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return false,
            };
            let (guard, _) = self
                .inner
                .signal
                .wait_timeout(flag, remaining)
                .unwrap_or_else(|e| e.into_inner());
            flag = guard;
        }
        true
    }
}

/// A view over several tokens that reads as cancelled when any of them is.
///
/// Used where one blocking activity must honor multiple cancellation
/// sources (the operation's own token plus the manager-wide ones). Timed
/// waits poll at a coarse interval; fine-grained wakeup only matters for
/// the long retry backoff sleeps, which wait on a single real token.
#[derive(Clone, Default)]
pub struct CancelSet {
    tokens: Vec<CancelToken>,
}

impl CancelSet {
    pub fn new(tokens: impl IntoIterator<Item = CancelToken>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.iter().any(CancelToken::is_cancelled)
    }

    /// Sleep for `duration` unless any token fires first.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        const POLL: Duration = Duration::from_millis(25);
        let deadline = std::time::Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return false,
            };
            std::thread::sleep(remaining.min(POLL));
        }
    }
}

impl From<CancelToken> for CancelSet {
    fn from(token: CancelToken) -> Self {
        Self::new([token])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn wait_times_out_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_a_waiting_thread() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn set_fires_when_any_member_fires() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        let set = CancelSet::new([a.clone(), b.clone()]);
        assert!(!set.is_cancelled());
        b.cancel();
        assert!(set.is_cancelled());
        assert!(set.wait_timeout(Duration::from_secs(1)));
    }
}
