// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! A small replacement for the `Eventual<T>` construct found in earlier
//! agents: a periodically refreshed, mutex-free shared value built on
//! `tokio::sync::watch`. Subscribers always see the latest value; a
//! publisher that fails to produce a new value simply skips that tick and
//! leaves subscribers on the last-known-good value, rather than publishing
//! an error sentinel.

use std::{future::Future, time::Duration};

use tokio::{
    sync::watch,
    time::{self, sleep},
};
use tracing::warn;

/// Creates a watcher that calls `function` once to obtain an initial value,
/// then again every `interval` afterwards. A failing call is logged and
/// skipped; the previous value remains published.
pub async fn new_watcher<T, F, Fut>(interval: Duration, function: F) -> anyhow::Result<watch::Receiver<T>>
where
    F: Fn() -> Fut + Send + 'static,
    T: Sync + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    let initial_value = function().await?;
    let (tx, rx) = watch::channel(initial_value);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match function().await {
                Ok(value) => {
                    if tx.send(value).is_err() {
                        // No subscribers left; nothing more to do.
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "watcher refresh failed, keeping previous value");
                    sleep(interval.div_f32(2.0)).await;
                }
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn keeps_previous_value_on_refresh_error() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let rx = new_watcher(Duration::from_millis(10), move || {
            let attempt = attempt_clone.clone();
            async move {
                let n = attempt.fetch_add(1, Ordering::SeqCst);
                if n == 1 {
                    anyhow::bail!("transient failure");
                }
                Ok(n)
            }
        })
        .await
        .unwrap();

        assert_eq!(*rx.borrow(), 0);

        // Give the background task a few ticks: it will fail on attempt 1
        // and must leave the published value at the prior success.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let value = *rx.borrow();
        assert!(value == 0 || value >= 2, "unexpected published value {value}");
    }
}
