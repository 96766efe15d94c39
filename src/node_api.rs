use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

// Topic namespace spoken by the verme node firmware. Every node lives
// under `verme/<device_type>/<id>` and announces itself by publishing
// its node info to the `node` suffix within that namespace.
pub const TOPIC_ROOT: &str = "verme";
pub const NODE_SUFFIX: &str = "node";
pub const NODE_DISCOVERY_PATTERN: &str = "verme/+/+/node";

pub const DEVICE_TYPE_SHADES: &str = "shades";

pub const UPDATE_START_PAYLOAD: &str = "start";
pub const UPDATE_CHECK_PAYLOAD: &str = "check";

pub fn from_json<T: serde::de::DeserializeOwned, S: AsRef<[u8]>>(text: S) -> anyhow::Result<T> {
    let text = text.as_ref();
    serde_json_path_to_error::from_slice(text)
        .map_err(|err| anyhow::anyhow!("{err}. Input: {}", String::from_utf8_lossy(text)))
}

/// The topic namespace belonging to a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicBase {
    device_type: String,
    id: String,
}

impl TopicBase {
    pub fn new<T: Into<String>, I: Into<String>>(device_type: T, id: I) -> Self {
        Self {
            device_type: device_type.into(),
            id: id.into(),
        }
    }

    pub fn base(&self) -> String {
        format!(
            "{TOPIC_ROOT}/{device_type}/{id}",
            device_type = self.device_type,
            id = self.id
        )
    }

    /// Outbound: we ask the node to move by publishing here.
    /// Position commands are published retained so that battery powered
    /// nodes pick them up on their next wake.
    /// The node reports back on the `state` and `update/...` suffixes,
    /// which we consume via wildcard subscriptions.
    pub fn position_topic(&self) -> String {
        format!("{}/position", self.base())
    }

    pub fn update_start_topic(&self) -> String {
        format!("{}/update/start", self.base())
    }

    pub fn update_check_topic(&self) -> String {
        format!("{}/update/check", self.base())
    }
}

impl std::fmt::Display for TopicBase {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.base())
    }
}

/// Parse a discovery topic of the fixed shape `verme/<type>/<id>/node`.
/// Returns the `(device_type, id)` segments, or None when the topic
/// doesn't have that exact shape.
pub fn parse_node_topic(topic: &str) -> Option<(&str, &str)> {
    let mut parts = topic.split('/');
    let root = parts.next()?;
    let device_type = parts.next()?;
    let id = parts.next()?;
    let suffix = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if root != TOPIC_ROOT || suffix != NODE_SUFFIX || device_type.is_empty() || id.is_empty() {
        return None;
    }
    Some((device_type, id))
}

/// The JSON object a node publishes to its `node` topic to announce
/// itself. Fields beyond name and version are kept verbatim so that
/// newer firmware can ship extra metadata without breaking us.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct NodeInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

/// Parse a reported shade position payload: an ASCII integer in [0, 100].
/// Anything else is rejected so that a garbled report never moves the
/// projected position.
pub fn parse_reported_position(payload: &str) -> anyhow::Result<u8> {
    let position: i64 = payload
        .trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("position payload {payload:?} is not an integer: {err}"))?;
    if !(0..=100).contains(&position) {
        anyhow::bail!("position {position} is outside 0-100");
    }
    Ok(position as u8)
}

/// Commanded positions are clamped rather than rejected; the nearest
/// bound is what the node will be asked to move to.
pub fn clamp_position(position: i64) -> u8 {
    position.clamp(0, 100) as u8
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum UpdatePhase {
    #[default]
    Idle,
    Checking,
    Downloading,
    Installing,
    Success,
}

impl UpdatePhase {
    /// Parse the free-form `status` field; anything we don't recognize
    /// is treated as idle.
    pub fn parse(status: &str) -> Self {
        Self::from_str(status).unwrap_or_default()
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Checking | Self::Downloading | Self::Installing)
    }
}

/// `update/status` payload reported by a node during (and after) a
/// firmware update.
#[derive(Deserialize, Clone, Debug)]
pub struct UpdateStatus {
    pub status: Option<String>,
    pub progress: Option<u8>,
    pub current_version: Option<String>,
    pub last_check: Option<String>,
}

impl UpdateStatus {
    pub fn phase(&self) -> UpdatePhase {
        self.status
            .as_deref()
            .map(UpdatePhase::parse)
            .unwrap_or_default()
    }
}

/// `update/available` payload; published by a node after a check.
#[derive(Deserialize, Clone, Debug)]
pub struct UpdateAvailability {
    #[serde(default)]
    pub available: bool,
    pub version: Option<String>,
    pub release_notes: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_topic_shape() {
        assert_eq!(
            parse_node_topic("verme/shades/shade_001/node"),
            Some(("shades", "shade_001"))
        );
        assert_eq!(parse_node_topic("verme/shades/shade_001/state"), None);
        assert_eq!(parse_node_topic("verme/shades/node"), None);
        assert_eq!(parse_node_topic("verme/shades/shade_001/extra/node"), None);
        assert_eq!(parse_node_topic("other/shades/shade_001/node"), None);
        assert_eq!(parse_node_topic("verme//shade_001/node"), None);
    }

    #[test]
    fn topic_base() {
        let base = TopicBase::new("shades", "shade_001");
        assert_eq!(base.base(), "verme/shades/shade_001");
        assert_eq!(base.position_topic(), "verme/shades/shade_001/position");
        assert_eq!(
            base.update_start_topic(),
            "verme/shades/shade_001/update/start"
        );
        assert_eq!(
            base.update_check_topic(),
            "verme/shades/shade_001/update/check"
        );
    }

    #[test]
    fn node_info_keeps_extra_fields() {
        let info: NodeInfo =
            from_json(r#"{"name":"Bedroom Shade","version":"1.2","rssi":-67}"#).unwrap();
        assert_eq!(info.name.as_deref(), Some("Bedroom Shade"));
        assert_eq!(info.version.as_deref(), Some("1.2"));
        assert_eq!(info.extra.get("rssi"), Some(&serde_json::json!(-67)));

        // The payload must be a JSON object
        assert!(from_json::<NodeInfo, _>("[1,2,3]").is_err());
        assert!(from_json::<NodeInfo, _>("not json").is_err());
    }

    #[test]
    fn reported_position_bounds() {
        assert_eq!(parse_reported_position("0").unwrap(), 0);
        assert_eq!(parse_reported_position("50").unwrap(), 50);
        assert_eq!(parse_reported_position(" 100 ").unwrap(), 100);
        assert!(parse_reported_position("101").is_err());
        assert!(parse_reported_position("-1").is_err());
        assert!(parse_reported_position("5.5").is_err());
        assert!(parse_reported_position("open").is_err());
    }

    #[test]
    fn commanded_position_clamps() {
        assert_eq!(clamp_position(-20), 0);
        assert_eq!(clamp_position(0), 0);
        assert_eq!(clamp_position(42), 42);
        assert_eq!(clamp_position(250), 100);
    }

    #[test]
    fn update_phase_parse() {
        assert_eq!(UpdatePhase::parse("installing"), UpdatePhase::Installing);
        assert_eq!(UpdatePhase::parse("Checking"), UpdatePhase::Checking);
        assert_eq!(UpdatePhase::parse("success"), UpdatePhase::Success);
        assert_eq!(UpdatePhase::parse("rebooting"), UpdatePhase::Idle);
        assert!(UpdatePhase::parse("downloading").is_busy());
        assert!(!UpdatePhase::parse("success").is_busy());
    }

    #[test]
    fn update_status_parse() {
        let status: UpdateStatus =
            from_json(r#"{"status":"installing","progress":42}"#).unwrap();
        assert_eq!(status.phase(), UpdatePhase::Installing);
        assert_eq!(status.progress, Some(42));

        // A status with no status field is treated as idle
        let status: UpdateStatus = from_json(r#"{"progress":10}"#).unwrap();
        assert_eq!(status.phase(), UpdatePhase::Idle);
    }
}
