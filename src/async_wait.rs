// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Async adapters for the blocking waits (feature `async`).
//!
//! Waits may block in the driver for a long time, so they run on tokio's
//! blocking thread pool instead of an executor thread.

use crate::completion_group::CompletionGroup;
use crate::error::{ScalError, ScalResult};
use crate::fence::HostFenceCounter;
use std::sync::Arc;

async fn blocking<F>(wait: F) -> ScalResult<()>
where
    F: FnOnce() -> ScalResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(wait)
        .await
        .map_err(|e| ScalError::Failure(format!("wait task: {e}")))?
}

impl CompletionGroup {
    /// Async [`wait`](Self::wait).
    pub async fn wait_async(self: Arc<Self>, target: u64, timeout_us: u64) -> ScalResult<()> {
        blocking(move || self.wait(target, timeout_us)).await
    }
}

impl HostFenceCounter {
    /// Async [`wait`](Self::wait).
    pub async fn wait_async(self: Arc<Self>, credits: u64, timeout_us: u64) -> ScalResult<()> {
        blocking(move || self.wait(credits, timeout_us)).await
    }
}

#[cfg(test)]
mod tests {
    use crate::completion_group::tests::Fixture;
    use crate::completion_group::GroupKind;
    use crate::config::Timeouts;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_async() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let dev = Arc::clone(&fx.dev);
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            dev.signal(0, 2);
        });
        rt.block_on(Arc::clone(&cg).wait_async(2, 1_000_000)).unwrap();
        signaller.join().unwrap();
        assert!(rt.block_on(cg.wait_async(3, 1_000)).is_err());
    }
}
