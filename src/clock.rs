//! Waiting between steps, retries and cycles.
//!
//! The runner never calls `tokio::time::sleep` directly; it goes through a
//! [`Sleeper`] so that tests can record or skip the waits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Something that can suspend the runner for a while.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real waits on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::time::sleep(duration).await;
    }
}

#[async_trait]
impl<T: Sleeper + ?Sized> Sleeper for Arc<T> {
    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await
    }
}

/// Render a wait for humans: `6h`, `5m`, `90s`, `250ms`.
pub fn format_wait(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        let millis = duration.as_millis();
        return if millis == 0 {
            "0s".to_string()
        } else {
            format!("{}ms", millis)
        };
    }

    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
