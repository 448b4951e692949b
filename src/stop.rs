// =============================================================================
// stop.rs - THE CANCELLATION PLANE
// =============================================================================
//
// Exactly one way to stop the fleet, no matter who asked. SIGINT from an
// operator, SIGTERM from an orchestrator, a duration timer expiring, or an
// out-of-band `stop.flag` file appearing on disk: every one of them trips
// the same token, and every subsystem observes that token instead of a
// process-global flag.
//
// Workers check it at the top of each tick and inside every sleep. The
// reporter checks it between reports. The ramp loop checks it between
// stages. Once tripped it never untrips; a run only shuts down once.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Name of the out-of-band stop file, created inside the log directory.
/// External tooling (or the orchestrator winding down its shards) creates
/// it; the watcher below notices and trips the token.
pub const STOP_FLAG_FILE: &str = "stop.flag";

/// Shared cancellation token. Cheap to clone, safe to hand to every task.
/// Trips at most once; observers see the transition through a watch
/// channel, so nobody busy-polls.
#[derive(Clone)]
pub struct StopToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request shutdown. The first caller gets the log line; later callers
    /// are no-ops.
    pub fn trip(&self, reason: &str) {
        let was_stopped = self.tx.send_replace(true);
        if !was_stopped {
            info!(reason = reason, "stop requested, winding down the fleet");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token trips. Resolves immediately if it already has.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Owned variant of [`cancelled`] for APIs that demand a `'static`
    /// future, e.g. axum's graceful shutdown hook.
    pub fn cancelled_owned(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// Sleep for up to `timeout`. Returns `true` if the stop fired first
    /// (or had already fired), `false` if the full sleep elapsed.
    pub async fn sleep(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => false,
            _ = self.cancelled() => true,
        }
    }

    /// Sleep until an absolute deadline. Same contract as [`sleep`].
    pub async fn sleep_until(&self, deadline: tokio::time::Instant) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => false,
            _ = self.cancelled() => true,
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Trip the token on SIGINT, and on SIGTERM where the platform has one.
pub fn install_signal_handlers(stop: &StopToken) {
    let token = stop.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => token.trip("SIGINT"),
                        _ = sigterm.recv() => token.trip("SIGTERM"),
                    }
                }
                Err(error) => {
                    warn!(error = %error, "could not register SIGTERM handler, SIGINT only");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        token.trip("SIGINT");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.trip("ctrl-c");
            }
        }
    });
}

/// Trip the token once the configured run duration elapses. A duration of
/// zero means "run until something else stops us".
pub fn spawn_duration_timer(stop: &StopToken, duration_secs: f64) {
    if duration_secs <= 0.0 {
        return;
    }
    let token = stop.clone();
    tokio::spawn(async move {
        if !token.sleep(Duration::from_secs_f64(duration_secs)).await {
            token.trip("duration elapsed");
        }
    });
}

pub fn stop_flag_path(dir: &Path) -> PathBuf {
    dir.join(STOP_FLAG_FILE)
}

/// Remove a flag left over from a previous run so it cannot instantly kill
/// this one.
pub fn clear_stale_stop_flag(path: &Path) {
    if path.exists() {
        if let Err(error) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %error, "could not remove stale stop flag");
        } else {
            info!(path = %path.display(), "removed stale stop flag from a previous run");
        }
    }
}

/// Poll for the stop file every 500 ms and trip the token when it shows up.
/// The watcher itself also exits once the token trips for any reason.
pub fn spawn_stop_flag_watcher(stop: &StopToken, path: PathBuf) {
    let token = stop.clone();
    tokio::spawn(async move {
        loop {
            if token.sleep(Duration::from_millis(500)).await {
                break;
            }
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                token.trip("stop flag observed");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trip_is_one_shot_and_observable() {
        let token = StopToken::new();
        assert!(!token.is_stopped());
        token.trip("first");
        token.trip("second");
        assert!(token.is_stopped());
        // Already-tripped tokens resolve immediately.
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("cancelled() should resolve after trip");
    }

    #[tokio::test]
    async fn test_sleep_reports_stop() {
        let token = StopToken::new();
        token.trip("test");
        assert!(token.sleep(Duration::from_secs(10)).await);

        let fresh = StopToken::new();
        assert!(!fresh.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_concurrent_trip() {
        let token = StopToken::new();
        let sleeper = token.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.trip("interrupt");
        let stopped = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sleep should return promptly after trip")
            .expect("task should not panic");
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_stop_flag_watcher_trips_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flag = stop_flag_path(dir.path());
        let token = StopToken::new();
        spawn_stop_flag_watcher(&token, flag.clone());
        std::fs::write(&flag, b"halt").expect("write flag");
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("watcher should observe the flag");
        assert!(token.is_stopped());
    }

    #[tokio::test]
    async fn test_duration_timer_trips_after_elapse() {
        let token = StopToken::new();
        spawn_duration_timer(&token, 0.05);
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("duration timer should trip the token");
    }

    #[test]
    fn test_zero_duration_never_arms() {
        // No runtime here on purpose: a zero duration must not even spawn.
        let token = StopToken::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            spawn_duration_timer(&token, 0.0);
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        assert!(!token.is_stopped());
    }
}
