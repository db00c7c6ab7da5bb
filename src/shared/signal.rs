use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// Ctrl-C clears the shared run flag; the scheduler checks it once per polling cycle.
// Teardown never looks at the flag, so a second Ctrl-C cannot cut it short.
pub fn install_ctrlc_handler() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let running_for_signal = Arc::clone(&running);
    ctrlc::set_handler(move || {
        if !running_for_signal.swap(false, Ordering::SeqCst) {
            log::warn!("shutdown already in progress");
        }
    })
    .context("installing Ctrl-C handler failed")?;
    Ok(running)
}
