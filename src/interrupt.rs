/* This is part of smartblock-agent - which is under the MIT License **********/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::error;
use snafu::{ResultExt};
use tokio::sync::watch;
use log::*;

/// Notification that the user asked the agent to stop.
///
/// The first "CTRL-C" lets the server finish the requests in flight, so that
/// no workspace or half-installed toolchain is left behind. A second one
/// exits right away.
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    fn new() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx: rx })
    }

    /// Resolve once an interruption was requested
    pub async fn wait(mut self) {
        loop {
            let requested = *self.rx.borrow_and_update();
            if requested {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handler gone: nobody will ever ask us to stop.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Install the process-wide interrupt handler.
pub fn install() -> Result<Shutdown> {
    let (tx, shutdown) = Shutdown::new();
    let requested = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler(move || {
        if requested.swap(true, Ordering::SeqCst) {
            error!("interrupted again, exiting now");
            std::process::exit(130);
        }
        warn!("interruption requested by user, finishing pending requests");
        let _ = tx.send(true);
    }).context(error::CtrlCFailed{})?;

    Ok(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_the_request() {
        let (tx, shutdown) = Shutdown::new();
        let waiter = tokio::spawn(shutdown.wait());
        tokio::task::yield_now().await;
        assert!(! waiter.is_finished());

        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_after_the_request_returns_at_once() {
        let (tx, shutdown) = Shutdown::new();
        tx.send(true).unwrap();
        shutdown.wait().await;
    }
}
