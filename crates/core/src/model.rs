//! Desired and actual state model.
//!
//! Desired units come from the catalogue database; actual units come from
//! the host probe. Both serialize on the management API, so field names here
//! are wire contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::paths;

/// The four kinds of managed unit, keyed to a rendering template each.
///
/// The discriminants are the integer representation stored in the
/// `desired_units.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    /// A persistent Docker container managed as a daemon.
    Simple = 0,
    /// A timer that fires another unit on a calendar schedule.
    Timer = 1,
    /// A container that runs once and terminates in an orderly fashion.
    OneShot = 2,
    /// The special unit that manages the coordinator binary itself.
    #[serde(rename = "self")]
    Coordinator = 3,
}

impl UnitType {
    /// Integer form stored in the catalogue.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Decode the catalogue integer form.
    pub fn from_i32(raw: i32) -> Option<UnitType> {
        match raw {
            0 => Some(UnitType::Simple),
            1 => Some(UnitType::Timer),
            2 => Some(UnitType::OneShot),
            3 => Some(UnitType::Coordinator),
            _ => None,
        }
    }

    /// Friendly name used on the API and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            UnitType::Simple => "simple",
            UnitType::Timer => "timer",
            UnitType::OneShot => "oneshot",
            UnitType::Coordinator => "self",
        }
    }

    /// Parse a friendly name.
    pub fn from_name(name: &str) -> Option<UnitType> {
        match name {
            "simple" => Some(UnitType::Simple),
            "timer" => Some(UnitType::Timer),
            "oneshot" => Some(UnitType::OneShot),
            "self" => Some(UnitType::Coordinator),
            _ => None,
        }
    }

    /// True for the unit types that run a container.
    pub fn uses_container(self) -> bool {
        matches!(self, UnitType::Simple | UnitType::OneShot)
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container descriptor attached to Simple and OneShot units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name passed to `docker run --name`. Required for Simple
    /// units; optional for OneShot units.
    #[serde(default)]
    pub name: String,
    /// Image name, constrained to the allow-listed registry prefix.
    pub image_name: String,
    /// Image tag. Never empty for a valid unit.
    pub image_tag: String,
    /// Image id resolved against the local daemon; `None` until resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Source repository recorded in the image's OCI labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Commit id recorded in the image's OCI labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Branch or ref recorded in the image's OCI labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

impl ContainerSpec {
    /// `name:tag` reference used for pulls and image listing.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }
}

/// A unit the catalogue says should exist on the host.
///
/// Construct through [`crate::builder::DesiredUnitBuilder`]; every instance
/// outside tests has passed the validity rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUnit {
    /// Catalogue row id; `None` before the first insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    /// Unit file path, directly under the unit directory with the managed
    /// basename prefix.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: UnitType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    /// Secret keys resolved into the unit's environment at render time.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host port to container port.
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
    /// Host path to container path. Host paths lie under the TLS directory.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    /// Calendar expression; present exactly when `kind` is Timer.
    #[serde(rename = "calendar", default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl DesiredUnit {
    /// Logical unit name: the basename of the unit file path.
    pub fn unit_name(&self) -> &str {
        paths::unit_name(&self.path)
    }

    /// Name shown in the unit's `Description=` line: the container name when
    /// one is set, else the logical unit name.
    pub fn display_name(&self) -> &str {
        match &self.container {
            Some(container) if !container.name.is_empty() => &container.name,
            _ => self.unit_name(),
        }
    }
}

/// A unit file observed on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualUnit {
    pub path: String,
    /// Raw unit file bytes as read from disk.
    #[serde(with = "content_base64")]
    pub content: Vec<u8>,
    /// Image id of the running container backing this unit, when one was
    /// resolvable by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl ActualUnit {
    pub fn unit_name(&self) -> &str {
        paths::unit_name(&self.path)
    }
}

/// Everything the catalogue wants true of the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub units: Vec<DesiredUnit>,
    /// Desired file contents by path: the three TLS files derived from the
    /// secret bag.
    #[serde(skip)]
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Everything observed on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualState {
    pub units: Vec<ActualUnit>,
    /// On-disk file contents by path; `None` for a file not yet present.
    #[serde(skip)]
    pub files: BTreeMap<String, Option<Vec<u8>>>,
}

/// Provenance of a container whose image changed during a reconciliation.
/// Consumed by the chat notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedContainer {
    /// Logical name of the unit the container backs.
    pub unit_name: String,
    pub image_name: String,
    pub image_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

impl UpdatedContainer {
    /// Build a provenance record from a desired unit's container.
    pub fn from_unit(unit: &DesiredUnit, container: &ContainerSpec) -> UpdatedContainer {
        UpdatedContainer {
            unit_name: unit.unit_name().to_string(),
            image_name: container.image_name.clone(),
            image_tag: container.image_tag.clone(),
            repository: container.repository.clone(),
            commit: container.commit.clone(),
            git_ref: container.git_ref.clone(),
        }
    }

    pub fn repository_url(&self) -> Option<String> {
        self.repository.clone()
    }

    pub fn commit_url(&self) -> Option<String> {
        match (&self.repository, &self.commit) {
            (Some(repo), Some(commit)) => Some(format!("{repo}/commit/{commit}")),
            _ => None,
        }
    }

    pub fn branch_url(&self) -> Option<String> {
        match (&self.repository, &self.git_ref) {
            (Some(repo), Some(git_ref)) => Some(format!("{repo}/tree/{git_ref}")),
            _ => None,
        }
    }
}

/// Unit file contents travel over the API as base64 strings.
mod content_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_unit() -> DesiredUnit {
        DesiredUnit {
            id: Some(1),
            path: "/etc/systemd/system/berth-web.service".into(),
            kind: UnitType::Simple,
            container: Some(ContainerSpec {
                name: "web".into(),
                image_name: "quay.io/berth/berth-web".into(),
                image_tag: "latest".into(),
                ..ContainerSpec::default()
            }),
            secrets: vec![],
            env: BTreeMap::new(),
            ports: BTreeMap::new(),
            volumes: BTreeMap::new(),
            schedule: None,
        }
    }

    #[test]
    fn unit_type_integer_mapping_round_trips() {
        for kind in [
            UnitType::Simple,
            UnitType::Timer,
            UnitType::OneShot,
            UnitType::Coordinator,
        ] {
            assert_eq!(UnitType::from_i32(kind.as_i32()), Some(kind));
            assert_eq!(UnitType::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(UnitType::from_i32(17), None);
        assert_eq!(UnitType::from_name("fancy"), None);
    }

    #[test]
    fn unit_type_serializes_to_friendly_name() {
        assert_eq!(
            serde_json::to_string(&UnitType::Coordinator).unwrap(),
            "\"self\""
        );
        assert_eq!(serde_json::to_string(&UnitType::OneShot).unwrap(), "\"oneshot\"");
    }

    #[test]
    fn display_name_prefers_container_name() {
        let unit = simple_unit();
        assert_eq!(unit.unit_name(), "berth-web.service");
        assert_eq!(unit.display_name(), "web");

        let mut nameless = unit.clone();
        nameless.container = None;
        assert_eq!(nameless.display_name(), "berth-web.service");
    }

    #[test]
    fn desired_unit_serializes_schedule_as_calendar() {
        let unit = DesiredUnit {
            id: None,
            path: "/etc/systemd/system/berth-nightly.timer".into(),
            kind: UnitType::Timer,
            container: None,
            secrets: vec![],
            env: BTreeMap::new(),
            ports: BTreeMap::new(),
            volumes: BTreeMap::new(),
            schedule: Some("*-*-* 03:00:00".into()),
        };
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["calendar"], "*-*-* 03:00:00");
        assert_eq!(value["type"], "timer");
        // Collections are emitted as empty, never null.
        assert!(value["secrets"].as_array().unwrap().is_empty());
        assert!(value["env"].as_object().unwrap().is_empty());
    }

    #[test]
    fn actual_unit_content_round_trips_as_base64() {
        let unit = ActualUnit {
            path: "/etc/systemd/system/berth-web.service".into(),
            content: b"[Unit]\nDescription=web\n".to_vec(),
            image_id: Some("sha256:abc".into()),
        };
        let json = serde_json::to_value(&unit).unwrap();
        assert!(json["content"].is_string());
        let back: ActualUnit = serde_json::from_value(json).unwrap();
        assert_eq!(back, unit);
    }

    #[test]
    fn commit_url_requires_repository_and_commit() {
        let updated = UpdatedContainer {
            unit_name: "berth-web.service".into(),
            image_name: "quay.io/berth/berth-web".into(),
            image_tag: "v3".into(),
            repository: Some("https://github.com/berth/web".into()),
            commit: Some("0f4c2a1".into()),
            git_ref: Some("main".into()),
        };
        assert_eq!(
            updated.commit_url().unwrap(),
            "https://github.com/berth/web/commit/0f4c2a1"
        );
        assert_eq!(
            updated.branch_url().unwrap(),
            "https://github.com/berth/web/tree/main"
        );
    }
}
