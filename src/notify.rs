//! Reports deployment outcomes back to the issuer without holding up the pass.

use std::{sync::Arc, time::Duration};

use log::{debug, error, warn};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    core::config::NotifySettings,
    issuance::issuer::{CallbackStatus, IssuerApi},
};

/// Receives per-domain outcomes from a pass.
pub trait CallbackSink: Send + Sync {
    /// Must return immediately.
    fn notify(&self, order_id: u64, domain: &str, success: bool, message: &str);
}

#[derive(Debug, Clone)]
struct Callback {
    order_id: u64,
    domain: String,
    status: CallbackStatus,
    message: String,
}

/// Queue in front of [`IssuerApi::notify`], drained in order by one worker task.
#[derive(Clone)]
pub struct CallbackNotifier {
    tx: mpsc::UnboundedSender<Callback>,
}

impl CallbackNotifier {
    /// Starts the worker on the current runtime. The worker exits when the
    /// token is cancelled or every notifier handle has been dropped and the
    /// queue is empty.
    pub fn spawn(
        api: Arc<dyn IssuerApi>,
        settings: NotifySettings,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(api, settings, rx, cancel));
        (Self { tx }, handle)
    }
}

impl CallbackSink for CallbackNotifier {
    fn notify(&self, order_id: u64, domain: &str, success: bool, message: &str) {
        let callback = Callback {
            order_id,
            domain: domain.to_string(),
            status: success.into(),
            message: message.to_string(),
        };
        if self.tx.send(callback).is_err() {
            warn!(
                "[notify] worker stopped; dropping callback for order {} ({})",
                order_id, domain
            );
        }
    }
}

async fn run_worker(
    api: Arc<dyn IssuerApi>,
    settings: NotifySettings,
    mut rx: mpsc::UnboundedReceiver<Callback>,
    cancel: CancellationToken,
) {
    loop {
        let callback = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(callback) => callback,
                None => break,
            },
        };
        deliver(&api, &settings, &callback, &cancel).await;
    }
    debug!("[notify] worker stopped");
}

async fn deliver(
    api: &Arc<dyn IssuerApi>,
    settings: &NotifySettings,
    callback: &Callback,
    cancel: &CancellationToken,
) -> bool {
    let attempts = settings.max_attempts.max(1);
    let max_backoff = Duration::from_millis(settings.max_backoff_ms);
    let mut backoff = Duration::from_millis(settings.initial_backoff_ms).min(max_backoff);

    for attempt in 1..=attempts {
        let api = api.clone();
        let sent = callback.clone();
        let result = tokio::task::spawn_blocking(move || {
            api.notify(sent.order_id, &sent.domain, sent.status, &sent.message)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(
                    "[notify] order {} {} reported after {} attempt(s)",
                    callback.order_id, callback.domain, attempt
                );
                return true;
            }
            Ok(Err(err)) if !err.is_transient() => {
                error!(
                    "[notify] order {} {} callback rejected: {}",
                    callback.order_id, callback.domain, err
                );
                return false;
            }
            Ok(Err(err)) => warn!(
                "[notify] order {} {} attempt {}/{} failed: {}",
                callback.order_id, callback.domain, attempt, attempts, err
            ),
            Err(err) => warn!(
                "[notify] order {} {} attempt {}/{} aborted: {}",
                callback.order_id, callback.domain, attempt, attempts, err
            ),
        }

        if attempt == attempts {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(
                    "[notify] cancelled while retrying order {} {}",
                    callback.order_id, callback.domain
                );
                return false;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max_backoff);
    }

    error!(
        "[notify] giving up on order {} {} after {} attempts",
        callback.order_id, callback.domain, attempts
    );
    false
}
