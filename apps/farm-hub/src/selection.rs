//! Picks a device for a new session. Pure over a snapshot of handles so the
//! registry can run it under its write lock and reserve in the same critical section.

use farm_proto::major_version;

use crate::capabilities::SessionRequest;
use crate::registry::HubDevice;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The requested udid can never satisfy this request; do not retry.
    Pinned(String),
    /// Nothing matches right now; the dispatcher retries until its deadline.
    Unavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub now_ms: i64,
    pub freshness_ms: i64,
}

pub fn select<'a, I>(devices: I, req: &SessionRequest, window: Window) -> Result<String, Rejection>
where
    I: IntoIterator<Item = &'a HubDevice>,
{
    match req.udid.as_deref() {
        Some(udid) => select_pinned(devices, udid, req, window),
        None => select_any(devices, req, window),
    }
}

fn select_pinned<'a, I>(
    devices: I,
    udid: &str,
    req: &SessionRequest,
    window: Window,
) -> Result<String, Rejection>
where
    I: IntoIterator<Item = &'a HubDevice>,
{
    let handle = devices
        .into_iter()
        .find(|h| h.device.udid == udid)
        .ok_or_else(|| Rejection::Pinned(format!("no device with udid {udid}")))?;

    if !handle.device.usage.allows_automation() {
        return Err(Rejection::Pinned(format!(
            "device {udid} is not enabled for automation"
        )));
    }
    if !handle.is_available_for_automation || handle.human_control_active(window.now_ms) {
        return Err(Rejection::Pinned(format!("device {udid} is busy")));
    }
    if let Some(os) = req.target_os() {
        if handle.device.os != os {
            return Err(Rejection::Pinned(format!(
                "device {udid} is not an {os} device"
            )));
        }
    }
    if !handle.is_eligible(window) {
        return Err(Rejection::Unavailable(format!(
            "device {udid} has no fresh live heartbeat from its provider"
        )));
    }
    Ok(handle.device.udid.clone())
}

fn select_any<'a, I>(devices: I, req: &SessionRequest, window: Window) -> Result<String, Rejection>
where
    I: IntoIterator<Item = &'a HubDevice>,
{
    let os = req.target_os();
    let mut candidates: Vec<&HubDevice> = devices
        .into_iter()
        .filter(|h| os.map_or(true, |os| h.device.os == os))
        .filter(|h| h.is_eligible(window))
        .filter(|h| h.is_available_for_automation)
        .filter(|h| h.device.usage.allows_automation())
        .filter(|h| !h.human_control_active(window.now_ms))
        .collect();
    candidates.sort_by(|a, b| a.device.udid.cmp(&b.device.udid));

    if let Some(version) = req.platform_version.as_deref() {
        let exact: Vec<&HubDevice> = candidates
            .iter()
            .copied()
            .filter(|h| h.device.os_version == version)
            .collect();
        candidates = if exact.is_empty() {
            match major_version(version) {
                Some(major) => candidates
                    .into_iter()
                    .filter(|h| major_version(&h.device.os_version) == Some(major))
                    .collect(),
                None => Vec::new(),
            }
        } else {
            exact
        };
    }

    candidates
        .first()
        .map(|h| h.device.udid.clone())
        .ok_or_else(|| Rejection::Unavailable(describe(req)))
}

fn describe(req: &SessionRequest) -> String {
    let os = req.target_os().map_or("any", |os| os.as_str());
    match req.platform_version.as_deref() {
        Some(version) => format!("no free {os} device with version {version}"),
        None => format!("no free {os} device"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_proto::{Device, DeviceOs, DeviceUsage, ProviderState};

    const NOW: i64 = 1_000_000;
    const WINDOW: Window = Window {
        now_ms: NOW,
        freshness_ms: 3_000,
    };

    fn live(udid: &str, os: DeviceOs, version: &str) -> HubDevice {
        let mut device = Device::new(udid, os);
        device.os_version = version.into();
        device.connected = true;
        device.provider_state = ProviderState::Live;
        device.last_updated_timestamp = NOW - 500;
        HubDevice::first_sighting(device)
    }

    fn android(version: &str) -> SessionRequest {
        SessionRequest {
            platform: Some(DeviceOs::Android),
            platform_version: Some(version.into()),
            ..Default::default()
        }
    }

    #[test_timeout::timeout]
    fn major_version_fallback_picks_same_major() {
        let devices = [live("B", DeviceOs::Ios, "17.3"), live("C", DeviceOs::Ios, "16.8")];
        let req = SessionRequest {
            platform: Some(DeviceOs::Ios),
            platform_version: Some("17.5".into()),
            ..Default::default()
        };
        assert_eq!(select(&devices, &req, WINDOW), Ok("B".into()));
    }

    #[test_timeout::timeout]
    fn exact_version_preferred_over_major() {
        let devices = [live("A", DeviceOs::Android, "13"), live("B", DeviceOs::Android, "13.1")];
        assert_eq!(select(&devices, &android("13.1"), WINDOW), Ok("B".into()));
        assert!(matches!(
            select(&devices, &android("14"), WINDOW),
            Err(Rejection::Unavailable(_))
        ));
    }

    #[test_timeout::timeout]
    fn candidates_are_ordered_by_udid() {
        let devices = [
            live("Z", DeviceOs::Android, "13"),
            live("M", DeviceOs::Android, "13"),
            live("Q", DeviceOs::Ios, "17"),
        ];
        let req = SessionRequest {
            platform: Some(DeviceOs::Android),
            ..Default::default()
        };
        assert_eq!(select(&devices, &req, WINDOW), Ok("M".into()));
    }

    #[test_timeout::timeout]
    fn skips_stale_busy_and_restricted_devices() {
        let mut stale = live("A", DeviceOs::Android, "13");
        stale.device.last_updated_timestamp = NOW - 4_000;
        let mut busy = live("B", DeviceOs::Android, "13");
        busy.is_available_for_automation = false;
        let mut controlled = live("C", DeviceOs::Android, "13");
        controlled.device.usage = DeviceUsage::Control;
        let mut preparing = live("D", DeviceOs::Android, "13");
        preparing.device.provider_state = ProviderState::Preparing;
        let mut human = live("E", DeviceOs::Android, "13");
        human.in_use_by = "alice".into();
        human.in_use_ts = NOW - 1_000;
        let free = live("F", DeviceOs::Android, "13");

        let devices = [stale, busy, controlled, preparing, human, free];
        assert_eq!(select(&devices, &android("13"), WINDOW), Ok("F".into()));
        assert!(matches!(
            select(&devices[..5], &android("13"), WINDOW),
            Err(Rejection::Unavailable(_))
        ));
    }

    #[test_timeout::timeout]
    fn pinned_busy_rejects_immediately() {
        let mut x = live("X", DeviceOs::Ios, "17.2");
        x.is_available_for_automation = false;
        let req = SessionRequest {
            udid: Some("X".into()),
            ..Default::default()
        };
        assert_eq!(
            select([&x], &req, WINDOW),
            Err(Rejection::Pinned("device X is busy".into()))
        );
    }

    #[test_timeout::timeout]
    fn pinned_unknown_and_stale_are_distinguished() {
        let mut x = live("X", DeviceOs::Ios, "17.2");
        x.device.last_updated_timestamp = NOW - 10_000;
        let unknown = SessionRequest {
            udid: Some("nope".into()),
            ..Default::default()
        };
        assert_eq!(
            select([&x], &unknown, WINDOW),
            Err(Rejection::Pinned("no device with udid nope".into()))
        );
        let pinned = SessionRequest {
            udid: Some("X".into()),
            ..Default::default()
        };
        assert!(matches!(
            select([&x], &pinned, WINDOW),
            Err(Rejection::Unavailable(_))
        ));
    }

    #[test_timeout::timeout]
    fn automation_name_stands_in_for_platform() {
        let devices = [live("A", DeviceOs::Android, "13"), live("I", DeviceOs::Ios, "17")];
        let req = SessionRequest {
            automation: Some(DeviceOs::Ios),
            ..Default::default()
        };
        assert_eq!(select(&devices, &req, WINDOW), Ok("I".into()));
    }
}
