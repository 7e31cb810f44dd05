pub mod auction;
pub mod http;
pub mod timer;

pub use self::{auction::*, http::*};
use anyhow::{format_err, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Service execution control instance
///
/// Every service is a long running task, and we would like to be able to
/// gracefully terminate them, and handle a top-level error of any of them
/// by gracefully stopping everything else.
#[derive(Clone)]
pub struct ServiceControl {
    stop_all: Arc<watch::Sender<bool>>,
    stopped: watch::Receiver<bool>,
}

impl Default for ServiceControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceControl {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            stop_all: Arc::new(tx),
            stopped: rx,
        }
    }

    pub fn stop_all(&self) {
        self.stop_all.send_replace(true);
    }

    /// Resolves once `stop_all` was called, by anyone
    pub async fn stopped(&self) {
        let mut rx = self.stopped.clone();
        // the sender lives in `self`, so this can't fail
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Run `service` until it ends or everything is stopped
    ///
    /// A service ending with an error stops all the others too.
    pub async fn run<F>(&self, name: &str, service: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let res = match tokio::spawn(service).await {
            Ok(res) => res,
            Err(e) => Err(format_err!("service {name} panicked: {e}")),
        };
        if res.is_err() {
            self.stop_all();
        }
        info!(service = name, ok = res.is_ok(), "service finished");
        res
    }
}
