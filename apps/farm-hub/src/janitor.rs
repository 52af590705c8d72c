use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::registry::Registry;

/// Releases idle leases every `period`.
pub fn spawn_janitor(registry: Arc<Registry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for (udid, session_id) in registry.reap_idle(farm_proto::now_millis()) {
                info!(udid = %udid, session_id = %session_id, "idle session released");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SessionRequest;
    use crate::selection::Window;
    use farm_proto::{Device, DeviceOs, ProviderData, ProviderState, ProviderUpdate};

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn expired_lease_cleared_within_one_period() {
        let registry = Arc::new(Registry::new());
        let now = farm_proto::now_millis();
        let mut device = Device::new("A1", DeviceOs::Android);
        device.connected = true;
        device.provider_state = ProviderState::Live;
        device.last_updated_timestamp = now;
        registry.apply_update(ProviderUpdate {
            provider: ProviderData::new("lab-1", "127.0.0.1", 10001),
            device_data: vec![device],
        });
        let window = Window {
            now_ms: now - 20_000,
            freshness_ms: 30_000,
        };
        let req = SessionRequest {
            new_command_timeout_secs: Some(10.0),
            ..Default::default()
        };
        registry.reserve(&req, window, 60_000).unwrap();
        registry.pin_session("A1", "S-9", now - 20_000);

        let janitor = spawn_janitor(registry.clone(), Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(registry.find_session("S-9").is_none());
        assert!(registry.get("A1").unwrap().is_available_for_automation);
        janitor.abort();
    }
}
