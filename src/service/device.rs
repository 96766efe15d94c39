use crate::node_api::{
    NodeInfo, TopicBase, UpdateAvailability, UpdatePhase, UpdateStatus, DEVICE_TYPE_SHADES,
};
use chrono::{DateTime, Duration, Utc};

#[derive(Clone, Debug)]
pub struct Device {
    pub id: String,
    pub device_type: String,

    /// Metadata from the most recent discovery message; replaced
    /// wholesale each time the node re-announces itself.
    pub node_info: NodeInfo,

    /// When we last heard anything at all from this node
    pub last_seen: DateTime<Utc>,
    /// Set by the reconciliation pass once last_seen falls outside
    /// the configured TTL. Cleared the moment the node speaks again.
    pub lost: bool,

    pub cover: CoverState,
    pub firmware: FirmwareState,
}

/// Projection of the shade position. The value reported by the node
/// and the value we last commanded are tracked separately so that an
/// unacknowledged command can be noticed and expired, instead of
/// silently diverging from reality.
#[derive(Default, Clone, Debug)]
pub struct CoverState {
    reported: Option<u8>,
    pending: Option<PendingPosition>,
}

#[derive(Clone, Debug)]
pub struct PendingPosition {
    pub position: u8,
    pub issued_at: DateTime<Utc>,
}

/// Projection of the firmware update topics.
#[derive(Default, Clone, Debug)]
pub struct FirmwareState {
    phase: UpdatePhase,
    progress: u8,
    /// Version the node reported after a successful update. Until one
    /// arrives, the installed version is whatever discovery announced.
    reported_version: Option<String>,
    latest_version: Option<String>,
    release_notes: Option<String>,
    last_check: Option<String>,
    /// Set when we issue an install command, cleared by the next
    /// status report from the node.
    install_requested: bool,
}

impl Device {
    /// Create a new device given just its type and id. The discovery
    /// payload is applied separately by the caller.
    pub fn new<T: Into<String>, I: Into<String>>(device_type: T, id: I) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            node_info: NodeInfo::default(),
            last_seen: Utc::now(),
            lost: false,
            cover: CoverState::default(),
            firmware: FirmwareState::default(),
        }
    }

    /// Overwrite the record portion of this device from a discovery
    /// message. Last write wins; projector state is untouched.
    pub fn apply_discovery<T: Into<String>>(&mut self, device_type: T, info: NodeInfo) {
        self.device_type = device_type.into();
        self.node_info = info;
        self.touch();
    }

    /// Note that the node just said something. Returns true if it had
    /// been marked lost, so the caller can flip its availability back.
    pub fn touch(&mut self) -> bool {
        self.last_seen = Utc::now();
        std::mem::replace(&mut self.lost, false)
    }

    pub fn topic(&self) -> TopicBase {
        TopicBase::new(&self.device_type, &self.id)
    }

    pub fn is_shade(&self) -> bool {
        self.device_type == DEVICE_TYPE_SHADES
    }

    /// The node's announced name, falling back to a name computed from
    /// its id.
    pub fn name(&self) -> String {
        match &self.node_info.name {
            Some(name) => name.to_string(),
            None => format!("Verme {}", self.id),
        }
    }

    /// Model string shown in the Home Assistant device registry.
    pub fn model(&self) -> String {
        if self.is_shade() {
            "Verme Shade".to_string()
        } else {
            format!("Verme {}", title_case(&self.device_type))
        }
    }

    /// The projected position: a pending command wins over the last
    /// report until the node acknowledges or the command expires.
    pub fn position(&self) -> Option<u8> {
        self.cover
            .pending
            .as_ref()
            .map(|p| p.position)
            .or(self.cover.reported)
    }

    pub fn is_closed(&self) -> Option<bool> {
        self.position().map(|p| p == 0)
    }

    /// A validated position report from the node. This reconciles any
    /// pending command, acknowledged or not; the node has spoken.
    pub fn apply_reported_position(&mut self, position: u8) {
        self.cover.reported = Some(position);
        self.cover.pending = None;
    }

    /// Record a just-issued position command as the optimistic
    /// projection.
    pub fn note_commanded_position(&mut self, position: u8) {
        self.cover.pending = Some(PendingPosition {
            position,
            issued_at: Utc::now(),
        });
    }

    /// Drop a pending position command that was never acknowledged
    /// within the timeout, reverting the projection to the last
    /// reported value. Returns the expired command, if any.
    pub fn expire_pending_position(&mut self, timeout: Duration) -> Option<PendingPosition> {
        let expired = match &self.cover.pending {
            Some(pending) => Utc::now() - pending.issued_at > timeout,
            None => false,
        };
        if expired {
            self.cover.pending.take()
        } else {
            None
        }
    }

    pub fn installed_version(&self) -> Option<String> {
        self.firmware
            .reported_version
            .clone()
            .or_else(|| self.node_info.version.clone())
    }

    pub fn latest_version(&self) -> Option<String> {
        self.firmware.latest_version.clone()
    }

    pub fn release_notes(&self) -> Option<String> {
        self.firmware.release_notes.clone()
    }

    pub fn last_update_check(&self) -> Option<String> {
        self.firmware.last_check.clone()
    }

    pub fn update_available(&self) -> bool {
        self.firmware.latest_version.is_some()
    }

    pub fn update_in_progress(&self) -> bool {
        self.firmware.install_requested || self.firmware.phase.is_busy()
    }

    pub fn update_percentage(&self) -> Option<u8> {
        if self.update_in_progress() {
            Some(self.firmware.progress)
        } else {
            None
        }
    }

    pub fn apply_update_status(&mut self, status: &UpdateStatus) {
        let phase = status.phase();
        self.firmware.phase = phase;
        self.firmware.install_requested = false;
        self.firmware.progress = status.progress.unwrap_or(0);
        if status.last_check.is_some() {
            self.firmware.last_check = status.last_check.clone();
        }

        if phase == UpdatePhase::Success {
            if let Some(version) = &status.current_version {
                self.firmware.reported_version = Some(version.to_string());
            }
            self.firmware.latest_version = None;
            self.firmware.release_notes = None;
        }
    }

    pub fn apply_update_availability(&mut self, avail: &UpdateAvailability) {
        if avail.available {
            self.firmware.latest_version = avail.version.clone();
            self.firmware.release_notes = avail.release_notes.clone();
        } else {
            self.firmware.latest_version = None;
            self.firmware.release_notes = None;
        }
    }

    /// Optimistically reflect a just-issued install command until the
    /// node starts reporting status.
    pub fn note_install_requested(&mut self) {
        self.firmware.install_requested = true;
        self.firmware.progress = 0;
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} ({})", self.name(), self.id)
    }
}

fn title_case(s: &str) -> String {
    let mut result = String::new();
    let mut start_of_word = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if start_of_word {
                result.extend(c.to_uppercase());
            } else {
                result.push(c);
            }
            start_of_word = false;
        } else {
            result.push(' ');
            start_of_word = true;
        }
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node_api::from_json;

    fn shade() -> Device {
        let mut device = Device::new("shades", "shade_001");
        device.apply_discovery(
            "shades",
            from_json(r#"{"name":"Bedroom Shade","version":"1.2"}"#).unwrap(),
        );
        device
    }

    #[test]
    fn naming() {
        let device = shade();
        assert_eq!(device.name(), "Bedroom Shade");
        assert_eq!(device.model(), "Verme Shade");

        let device = Device::new("sensors", "sensor_001");
        assert_eq!(device.name(), "Verme sensor_001");
        assert_eq!(device.model(), "Verme Sensors");
    }

    #[test]
    fn position_projection() {
        let mut device = shade();
        assert_eq!(device.position(), None);
        assert_eq!(device.is_closed(), None);

        device.apply_reported_position(50);
        assert_eq!(device.position(), Some(50));
        assert_eq!(device.is_closed(), Some(false));

        device.apply_reported_position(0);
        assert_eq!(device.is_closed(), Some(true));
    }

    #[test]
    fn commanded_position_wins_until_reported() {
        let mut device = shade();
        device.apply_reported_position(10);
        device.note_commanded_position(80);
        assert_eq!(device.position(), Some(80));

        // The next report reconciles the pending command even if it
        // disagrees; the node is the source of truth.
        device.apply_reported_position(75);
        assert_eq!(device.position(), Some(75));
        assert!(device.cover.pending.is_none());
    }

    #[test]
    fn pending_position_expires() {
        let mut device = shade();
        device.apply_reported_position(10);
        device.note_commanded_position(80);

        assert!(device.expire_pending_position(Duration::seconds(60)).is_none());
        assert_eq!(device.position(), Some(80));

        let expired = device.expire_pending_position(Duration::seconds(-1)).unwrap();
        assert_eq!(expired.position, 80);
        assert_eq!(device.position(), Some(10));
    }

    #[test]
    fn discovery_overwrites_record_not_projection() {
        let mut device = shade();
        device.apply_reported_position(25);

        device.apply_discovery(
            "shades",
            from_json(r#"{"name":"Renamed Shade","version":"1.3"}"#).unwrap(),
        );
        assert_eq!(device.name(), "Renamed Shade");
        assert_eq!(device.installed_version().as_deref(), Some("1.3"));
        assert_eq!(device.position(), Some(25));
    }

    #[test]
    fn update_status_machine() {
        let mut device = shade();
        assert!(!device.update_in_progress());
        assert_eq!(device.update_percentage(), None);
        assert_eq!(device.installed_version().as_deref(), Some("1.2"));

        let status: UpdateStatus =
            from_json(r#"{"status":"installing","progress":42}"#).unwrap();
        device.apply_update_status(&status);
        assert!(device.update_in_progress());
        assert_eq!(device.update_percentage(), Some(42));

        let status: UpdateStatus =
            from_json(r#"{"status":"success","current_version":"2.0"}"#).unwrap();
        device.apply_update_status(&status);
        assert!(!device.update_in_progress());
        assert_eq!(device.update_percentage(), None);
        assert_eq!(device.installed_version().as_deref(), Some("2.0"));
        assert!(!device.update_available());
    }

    #[test]
    fn success_without_version_keeps_prior() {
        let mut device = shade();
        let status: UpdateStatus = from_json(r#"{"status":"success"}"#).unwrap();
        device.apply_update_status(&status);
        assert_eq!(device.installed_version().as_deref(), Some("1.2"));
    }

    #[test]
    fn unknown_status_is_idle() {
        let mut device = shade();
        let status: UpdateStatus = from_json(r#"{"status":"rebooting"}"#).unwrap();
        device.apply_update_status(&status);
        assert!(!device.update_in_progress());
    }

    #[test]
    fn availability_sets_and_clears() {
        let mut device = shade();

        let avail: UpdateAvailability =
            from_json(r#"{"available":true,"version":"2.0","release_notes":"fix"}"#).unwrap();
        device.apply_update_availability(&avail);
        assert!(device.update_available());
        assert_eq!(device.latest_version().as_deref(), Some("2.0"));
        assert_eq!(device.release_notes().as_deref(), Some("fix"));

        let avail: UpdateAvailability = from_json(r#"{"available":false}"#).unwrap();
        device.apply_update_availability(&avail);
        assert!(!device.update_available());
        assert_eq!(device.latest_version(), None);
        assert_eq!(device.release_notes(), None);
    }

    #[test]
    fn install_request_is_optimistic() {
        let mut device = shade();
        device.note_install_requested();
        assert!(device.update_in_progress());
        assert_eq!(device.update_percentage(), Some(0));

        // First status report from the node takes over
        let status: UpdateStatus = from_json(r#"{"status":"idle"}"#).unwrap();
        device.apply_update_status(&status);
        assert!(!device.update_in_progress());
    }
}
