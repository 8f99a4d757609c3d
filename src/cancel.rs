use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::warn;

/// Shared stop flag checked by every loop and sleep in the crawler.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled on Ctrl-C.
    pub fn from_interrupt() -> Self {
        let token = CancelToken::new();
        let handle = token.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("interrupt received, stopping workers");
            handle.cancel();
        }) {
            warn!("unable to install interrupt handler: {}", e);
        }
        token
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CancelToken;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(crate::Error::Cancelled)));
    }
}
