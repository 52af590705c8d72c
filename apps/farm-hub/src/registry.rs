//! Hub-side view of every device reported by any provider, plus the lease
//! fields the hub owns. One `RwLock` guards the whole table and is never held
//! across an await.

use std::collections::{BTreeMap, HashMap};

use farm_proto::{Device, ProviderData, ProviderUpdate};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::capabilities::SessionRequest;
use crate::selection::{self, Rejection, Window};

pub const AUTOMATION: &str = "automation";

/// A human control claim lapses this long after its last refresh.
pub const CONTROL_LEASE_MS: i64 = 3_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubDevice {
    #[serde(flatten)]
    pub device: Device,
    pub session_id: String,
    pub in_use_by: String,
    pub in_use_ts: i64,
    pub is_running_automation: bool,
    pub is_available_for_automation: bool,
    pub last_automation_action_ts: i64,
    pub appium_new_command_timeout: i64,
}

impl HubDevice {
    pub fn first_sighting(device: Device) -> Self {
        Self {
            device,
            session_id: String::new(),
            in_use_by: String::new(),
            in_use_ts: 0,
            is_running_automation: false,
            is_available_for_automation: true,
            last_automation_action_ts: 0,
            appium_new_command_timeout: 0,
        }
    }

    /// Connected, live and heard from within the freshness window.
    pub fn is_eligible(&self, window: Window) -> bool {
        self.device.connected
            && self.device.provider_state == farm_proto::ProviderState::Live
            && self.device.is_fresh(window.now_ms, window.freshness_ms)
    }

    pub fn human_control_active(&self, now_ms: i64) -> bool {
        !self.in_use_by.is_empty()
            && self.in_use_by != AUTOMATION
            && self.in_use_ts >= now_ms - CONTROL_LEASE_MS
    }

    fn holds_session(&self, session_id: &str) -> bool {
        !session_id.is_empty() && self.session_id == session_id
    }

    fn clear_lease(&mut self) {
        self.session_id.clear();
        self.is_running_automation = false;
        self.is_available_for_automation = true;
        if self.in_use_by == AUTOMATION {
            self.in_use_by.clear();
        }
    }
}

/// Where the dispatcher sends the creation call for a reserved device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub udid: String,
    pub base_url: String,
}

/// Routing target for an in-session call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub udid: String,
    pub base_url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    UnknownDevice,
    RunningAutomation,
    HeldBy(String),
}

#[derive(Default)]
pub struct Registry {
    devices: RwLock<HashMap<String, HubDevice>>,
    providers: RwLock<BTreeMap<String, ProviderData>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a heartbeat. Projections are replaced, lease fields are kept.
    pub fn apply_update(&self, update: ProviderUpdate) {
        let ProviderUpdate {
            provider,
            device_data,
        } = update;
        {
            let mut devices = self.devices.write();
            for device in device_data {
                match devices.get_mut(&device.udid) {
                    Some(handle) => handle.device = device,
                    None => {
                        info!(udid = %device.udid, provider = %provider.nickname, "device first seen");
                        devices.insert(device.udid.clone(), HubDevice::first_sighting(device));
                    }
                }
            }
        }
        self.providers
            .write()
            .insert(provider.nickname.clone(), provider);
    }

    /// Loads persisted records without overriding anything a provider already reported.
    pub fn seed(&self, stored: Vec<Device>, providers: Vec<ProviderData>) {
        let mut devices = self.devices.write();
        for mut device in stored {
            device.connected = false;
            devices
                .entry(device.udid.clone())
                .or_insert_with(|| HubDevice::first_sighting(device));
        }
        drop(devices);
        let mut known = self.providers.write();
        for provider in providers {
            known.entry(provider.nickname.clone()).or_insert(provider);
        }
    }

    pub fn get(&self, udid: &str) -> Option<HubDevice> {
        self.devices.read().get(udid).cloned()
    }

    pub fn snapshot(&self) -> Vec<HubDevice> {
        let mut handles: Vec<HubDevice> = self.devices.read().values().cloned().collect();
        handles.sort_by(|a, b| a.device.udid.cmp(&b.device.udid));
        handles
    }

    pub fn device_records(&self) -> Vec<Device> {
        self.devices
            .read()
            .values()
            .map(|h| h.device.clone())
            .collect()
    }

    pub fn providers(&self) -> Vec<ProviderData> {
        self.providers.read().values().cloned().collect()
    }

    pub fn any_eligible(&self, window: Window) -> bool {
        self.devices.read().values().any(|h| {
            h.is_eligible(window)
                && h.is_available_for_automation
                && h.device.usage.allows_automation()
        })
    }

    /// Selects and reserves in one write-locked step so two dispatchers never
    /// reserve the same device.
    pub fn reserve(
        &self,
        req: &SessionRequest,
        window: Window,
        default_timeout_ms: i64,
    ) -> Result<Reservation, Rejection> {
        let mut devices = self.devices.write();
        let udid = selection::select(devices.values(), req, window)?;
        let handle = devices
            .get_mut(&udid)
            .ok_or_else(|| Rejection::Unavailable(format!("device {udid} vanished")))?;
        handle.is_running_automation = true;
        handle.is_available_for_automation = false;
        handle.session_id.clear();
        handle.last_automation_action_ts = window.now_ms;
        handle.appium_new_command_timeout = req.idle_timeout_ms(default_timeout_ms);
        debug!(udid = %udid, "device reserved");
        Ok(Reservation {
            base_url: handle.device.provider_base_url(),
            udid,
        })
    }

    /// Undoes a reservation whose creation call never produced a session.
    pub fn revert_reservation(&self, udid: &str) {
        let mut devices = self.devices.write();
        if let Some(handle) = devices.get_mut(udid) {
            if handle.is_running_automation && handle.session_id.is_empty() {
                handle.clear_lease();
                debug!(udid = %udid, "reservation reverted");
            }
        }
    }

    /// Binds a freshly created session id to its device; no other handle keeps it.
    pub fn pin_session(&self, udid: &str, session_id: &str, now_ms: i64) {
        let mut devices = self.devices.write();
        for handle in devices.values_mut() {
            if handle.device.udid != udid && handle.session_id == session_id {
                handle.clear_lease();
            }
        }
        if let Some(handle) = devices.get_mut(udid) {
            handle.session_id = session_id.to_string();
            handle.in_use_by = AUTOMATION.to_string();
            handle.is_running_automation = true;
            handle.is_available_for_automation = false;
            handle.last_automation_action_ts = now_ms;
        }
    }

    /// Resolves an active session. Released sessions no longer resolve.
    pub fn find_session(&self, session_id: &str) -> Option<SessionTarget> {
        self.devices
            .read()
            .values()
            .find(|h| {
                h.holds_session(session_id)
                    && h.is_running_automation
                    && !h.is_available_for_automation
            })
            .map(|h| SessionTarget {
                udid: h.device.udid.clone(),
                base_url: h.device.provider_base_url(),
                session_id: h.session_id.clone(),
            })
    }

    /// Records client activity on a session; the timestamp never moves backwards.
    pub fn touch(&self, udid: &str, session_id: &str, now_ms: i64) {
        let mut devices = self.devices.write();
        if let Some(handle) = devices.get_mut(udid) {
            if handle.holds_session(session_id) {
                handle.last_automation_action_ts = handle.last_automation_action_ts.max(now_ms);
            }
        }
    }

    /// Makes the device selectable again after a DELETE and returns the activity
    /// marker [`Registry::finalize_delete`] compares against.
    pub fn release_on_delete(&self, udid: &str, session_id: &str) -> Option<i64> {
        let mut devices = self.devices.write();
        let handle = devices.get_mut(udid)?;
        if !handle.holds_session(session_id) {
            return None;
        }
        handle.is_available_for_automation = true;
        Some(handle.last_automation_action_ts)
    }

    /// Clears the deleted session if nothing touched the device since the DELETE.
    pub fn finalize_delete(&self, udid: &str, session_id: &str, marker: i64) -> bool {
        let mut devices = self.devices.write();
        match devices.get_mut(udid) {
            Some(handle)
                if handle.holds_session(session_id)
                    && handle.last_automation_action_ts == marker =>
            {
                handle.clear_lease();
                true
            }
            _ => false,
        }
    }

    /// Releases leases idle past their timeout and lapsed human claims.
    /// Returns the `(udid, session_id)` pairs whose sessions were released.
    pub fn reap_idle(&self, now_ms: i64) -> Vec<(String, String)> {
        let mut released = Vec::new();
        let mut devices = self.devices.write();
        for handle in devices.values_mut() {
            // In-flight reservations belong to their dispatcher until it commits or reverts.
            if handle.is_running_automation
                && !handle.session_id.is_empty()
                && handle.last_automation_action_ts
                    <= now_ms - handle.appium_new_command_timeout
            {
                released.push((handle.device.udid.clone(), handle.session_id.clone()));
                handle.clear_lease();
            }
            if !handle.in_use_by.is_empty()
                && handle.in_use_by != AUTOMATION
                && !handle.human_control_active(now_ms)
            {
                handle.in_use_by.clear();
            }
        }
        released
    }

    /// Claims or refreshes a human control lease.
    pub fn claim_control(&self, udid: &str, user: &str, now_ms: i64) -> Result<(), ControlError> {
        let mut devices = self.devices.write();
        let handle = devices.get_mut(udid).ok_or(ControlError::UnknownDevice)?;
        if handle.is_running_automation {
            return Err(ControlError::RunningAutomation);
        }
        if handle.human_control_active(now_ms) && handle.in_use_by != user {
            return Err(ControlError::HeldBy(handle.in_use_by.clone()));
        }
        handle.in_use_by = user.to_string();
        handle.in_use_ts = now_ms;
        Ok(())
    }

    pub fn release_control(&self, udid: &str) -> Result<(), ControlError> {
        let mut devices = self.devices.write();
        let handle = devices.get_mut(udid).ok_or(ControlError::UnknownDevice)?;
        if handle.in_use_by != AUTOMATION {
            handle.in_use_by.clear();
            handle.in_use_ts = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_proto::{DeviceOs, ProviderState};

    const NOW: i64 = 5_000_000;
    const WINDOW: Window = Window {
        now_ms: NOW,
        freshness_ms: 3_000,
    };

    fn update(udids: &[&str], ts: i64) -> ProviderUpdate {
        let device_data = udids
            .iter()
            .map(|udid| {
                let mut device = Device::new(*udid, DeviceOs::Android);
                device.os_version = "13".into();
                device.host = "10.0.0.5:10001".into();
                device.provider = "lab-1".into();
                device.connected = true;
                device.provider_state = ProviderState::Live;
                device.last_updated_timestamp = ts;
                device
            })
            .collect();
        ProviderUpdate {
            provider: ProviderData::new("lab-1", "10.0.0.5", 10001),
            device_data,
        }
    }

    fn any_android() -> SessionRequest {
        SessionRequest {
            platform: Some(DeviceOs::Android),
            ..Default::default()
        }
    }

    #[test_timeout::timeout]
    fn heartbeat_is_idempotent() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1", "A2"], NOW));
        let first = registry.snapshot();
        registry.apply_update(update(&["A1", "A2"], NOW));
        assert_eq!(registry.snapshot(), first);
        assert_eq!(registry.providers().len(), 1);
    }

    #[test_timeout::timeout]
    fn heartbeat_keeps_lease_fields() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        let reservation = registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        registry.pin_session(&reservation.udid, "S-1", NOW);

        registry.apply_update(update(&["A1"], NOW + 1_000));
        let handle = registry.get("A1").unwrap();
        assert_eq!(handle.session_id, "S-1");
        assert_eq!(handle.in_use_by, AUTOMATION);
        assert!(handle.is_running_automation);
        assert!(!handle.is_available_for_automation);
        assert_eq!(handle.device.last_updated_timestamp, NOW + 1_000);
    }

    #[test_timeout::timeout]
    fn single_device_is_never_double_booked() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        let first = registry.reserve(&any_android(), WINDOW, 60_000);
        let second = registry.reserve(&any_android(), WINDOW, 60_000);
        assert_eq!(first.unwrap().udid, "A1");
        assert!(matches!(second, Err(Rejection::Unavailable(_))));
    }

    #[test_timeout::timeout]
    fn reservation_reverts_until_pinned() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        let reservation = registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        assert_eq!(reservation.base_url, "http://10.0.0.5:10001");
        registry.revert_reservation("A1");
        let handle = registry.get("A1").unwrap();
        assert!(handle.is_available_for_automation);
        assert!(!handle.is_running_automation);

        registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        registry.pin_session("A1", "S-2", NOW);
        registry.revert_reservation("A1");
        assert_eq!(registry.get("A1").unwrap().session_id, "S-2");
    }

    #[test_timeout::timeout]
    fn session_ids_stay_unique() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1", "A2"], NOW));
        registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        registry.pin_session("A1", "S-1", NOW);
        registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        registry.pin_session("A2", "S-1", NOW);

        let holders: Vec<_> = registry
            .snapshot()
            .into_iter()
            .filter(|h| h.session_id == "S-1")
            .map(|h| h.device.udid)
            .collect();
        assert_eq!(holders, vec!["A2".to_string()]);
        assert_eq!(registry.find_session("S-1").unwrap().udid, "A2");
    }

    #[test_timeout::timeout]
    fn idle_session_is_reaped_after_timeout() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        let req = SessionRequest {
            new_command_timeout_secs: Some(10.0),
            ..any_android()
        };
        registry.reserve(&req, WINDOW, 60_000).unwrap();
        registry.pin_session("A1", "S-9", NOW);

        assert!(registry.reap_idle(NOW + 9_999).is_empty());
        assert_eq!(
            registry.reap_idle(NOW + 10_000),
            vec![("A1".to_string(), "S-9".to_string())]
        );
        assert!(registry.find_session("S-9").is_none());
        let handle = registry.get("A1").unwrap();
        assert!(handle.is_available_for_automation);
        assert!(handle.in_use_by.is_empty());
    }

    #[test_timeout::timeout]
    fn in_flight_reservation_is_not_reaped() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        registry.reserve(&any_android(), WINDOW, 1_000).unwrap();
        assert!(registry.reap_idle(NOW + 120_000).is_empty());
        assert!(registry.get("A1").unwrap().is_running_automation);
    }

    #[test_timeout::timeout]
    fn delete_releases_then_finalizes() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        registry.pin_session("A1", "S-1", NOW);

        let marker = registry.release_on_delete("A1", "S-1").unwrap();
        assert!(registry.find_session("S-1").is_none());
        assert!(registry.get("A1").unwrap().is_available_for_automation);

        assert!(registry.finalize_delete("A1", "S-1", marker));
        let handle = registry.get("A1").unwrap();
        assert!(handle.session_id.is_empty());
        assert!(!handle.is_running_automation);
    }

    #[test_timeout::timeout]
    fn finalize_skips_device_reused_after_delete() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        registry.pin_session("A1", "S-1", NOW);
        let marker = registry.release_on_delete("A1", "S-1").unwrap();

        let later = Window {
            now_ms: NOW + 500,
            ..WINDOW
        };
        assert_eq!(registry.reserve(&any_android(), later, 60_000).unwrap().udid, "A1");
        registry.pin_session("A1", "S-2", NOW + 600);

        assert!(!registry.finalize_delete("A1", "S-1", marker));
        assert_eq!(registry.find_session("S-2").unwrap().udid, "A1");
    }

    #[test_timeout::timeout]
    fn touch_is_monotonic() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        registry.reserve(&any_android(), WINDOW, 60_000).unwrap();
        registry.pin_session("A1", "S-1", NOW + 100);
        registry.touch("A1", "S-1", NOW);
        assert_eq!(registry.get("A1").unwrap().last_automation_action_ts, NOW + 100);
        registry.touch("A1", "S-1", NOW + 200);
        assert_eq!(registry.get("A1").unwrap().last_automation_action_ts, NOW + 200);
    }

    #[test_timeout::timeout]
    fn stale_provider_devices_become_selectable_again() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW - 4_000));
        assert!(registry.reserve(&any_android(), WINDOW, 60_000).is_err());
        assert!(!registry.any_eligible(WINDOW));

        registry.apply_update(update(&["A1"], NOW));
        assert!(registry.any_eligible(WINDOW));
        assert!(registry.reserve(&any_android(), WINDOW, 60_000).is_ok());
    }

    #[test_timeout::timeout]
    fn seeded_devices_are_listed_but_unselectable() {
        let registry = Registry::new();
        let mut stored = Device::new("S1", DeviceOs::Android);
        stored.connected = true;
        stored.provider_state = ProviderState::Live;
        stored.last_updated_timestamp = NOW;
        registry.seed(vec![stored], vec![ProviderData::new("lab-9", "10.0.0.9", 10001)]);

        assert_eq!(registry.snapshot().len(), 1);
        assert!(!registry.get("S1").unwrap().device.connected);
        assert!(registry.reserve(&any_android(), WINDOW, 60_000).is_err());
        assert_eq!(registry.providers()[0].nickname, "lab-9");
    }

    #[test_timeout::timeout]
    fn human_control_blocks_selection_until_it_lapses() {
        let registry = Registry::new();
        registry.apply_update(update(&["A1"], NOW));
        registry.claim_control("A1", "alice", NOW).unwrap();
        assert_eq!(
            registry.claim_control("A1", "bob", NOW + 1_000),
            Err(ControlError::HeldBy("alice".into()))
        );
        assert!(registry.reserve(&any_android(), WINDOW, 60_000).is_err());

        registry.reap_idle(NOW + CONTROL_LEASE_MS + 1);
        assert!(registry.get("A1").unwrap().in_use_by.is_empty());
        let later = Window {
            now_ms: NOW + 1_000,
            ..WINDOW
        };
        assert!(registry.reserve(&any_android(), later, 60_000).is_ok());
        assert_eq!(
            registry.claim_control("A1", "bob", NOW + 1_000),
            Err(ControlError::RunningAutomation)
        );
    }
}
