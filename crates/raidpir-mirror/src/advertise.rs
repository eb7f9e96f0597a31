//! Periodic liveness advertisement to the vendor.
//!
//! Advertises immediately on startup, then every `interval`. A failed
//! advertisement is logged and retried on the next cycle; it never stops the
//! serving loop, and the vendor expires us if we stay silent too long.

use std::time::Duration;

use raidpir_core::fetch;
use raidpir_core::wire::MirrorInfo;

pub async fn advertise_loop(
    info: MirrorInfo,
    vendor_location: String,
    default_vendor_port: u16,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match fetch::advertise_mirror(&vendor_location, default_vendor_port, &info).await {
            Ok(()) => {
                tracing::debug!(vendor = %vendor_location, mirror = %info, "advertised to vendor");
            }
            Err(err) => {
                tracing::warn!(
                    vendor = %vendor_location,
                    error = %err,
                    "vendor advertisement failed, will retry"
                );
            }
        }
    }
}
