use super::ServiceInner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Restart the monitor thread whenever it is found dead without having been
/// stopped. Exits once the service is dropped or `shutdown` is raised.
pub(super) fn spawn(
    service: Weak<ServiceInner>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    name: String,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name(name).spawn(move || {
        loop {
            std::thread::park_timeout(interval);
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let Some(service) = service.upgrade() else {
                break;
            };
            match service.revive_monitor() {
                Ok(true) => tracing::warn!(monitor = %service.name, "monitor thread had died, restarted it"),
                Ok(false) => {}
                Err(e) => tracing::error!(monitor = %service.name, error = %e, "failed to restart monitor thread"),
            }
        }
    })
}
