//! Validating builder for desired units.
//!
//! Every desired unit enters the system through this builder -- the API
//! create/update handlers and the CLI both use it, so no partially-validated
//! unit ever reaches the catalogue or the differ.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::model::{ContainerSpec, DesiredUnit, UnitType};
use crate::paths::{lexical_clean, Paths, IMAGE_PREFIX};

/// Incremental, validating construction of a [`DesiredUnit`].
///
/// Setters validate the field they receive; [`DesiredUnitBuilder::build`]
/// runs the cross-field rules (type/container compatibility, timer/schedule
/// coupling, image allow-listing).
#[derive(Debug, Clone)]
pub struct DesiredUnitBuilder {
    paths: Paths,
    id: Option<i32>,
    path: Option<String>,
    kind: Option<UnitType>,
    container: Option<ContainerSpec>,
    secrets: Vec<String>,
    env: BTreeMap<String, String>,
    ports: BTreeMap<u16, u16>,
    volumes: BTreeMap<String, String>,
    schedule: Option<String>,
}

impl DesiredUnitBuilder {
    pub fn new(paths: Paths) -> DesiredUnitBuilder {
        DesiredUnitBuilder {
            paths,
            id: None,
            path: None,
            kind: None,
            container: None,
            secrets: Vec::new(),
            env: BTreeMap::new(),
            ports: BTreeMap::new(),
            volumes: BTreeMap::new(),
            schedule: None,
        }
    }

    /// Carry an existing catalogue row id through an update.
    pub fn id(mut self, id: i32) -> DesiredUnitBuilder {
        self.id = Some(id);
        self
    }

    /// Set the unit file path. The path is lexically normalized and must be
    /// directly under the unit directory with the managed basename prefix.
    pub fn path(mut self, path: &str) -> Result<DesiredUnitBuilder> {
        let cleaned = lexical_clean(path);
        if !self.paths.is_managed_unit_path(&cleaned) {
            return Err(Error::Validation(format!(
                "unit path {cleaned} is not directly under {} with the managed prefix",
                self.paths.unit_dir.display()
            )));
        }
        self.path = Some(cleaned);
        Ok(self)
    }

    pub fn kind(mut self, kind: UnitType) -> DesiredUnitBuilder {
        self.kind = Some(kind);
        self
    }

    /// Parse and set the unit type from its friendly name.
    pub fn kind_name(self, name: &str) -> Result<DesiredUnitBuilder> {
        match UnitType::from_name(name) {
            Some(kind) => Ok(self.kind(kind)),
            None => Err(Error::Validation(format!("unrecognized unit type: {name}"))),
        }
    }

    pub fn container(mut self, container: ContainerSpec) -> DesiredUnitBuilder {
        self.container = Some(container);
        self
    }

    pub fn secrets(mut self, secrets: Vec<String>) -> DesiredUnitBuilder {
        self.secrets = secrets;
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> DesiredUnitBuilder {
        self.env = env;
        self
    }

    pub fn ports(mut self, ports: BTreeMap<u16, u16>) -> DesiredUnitBuilder {
        self.ports = ports;
        self
    }

    /// Set volume mounts. Every host path is lexically normalized and must
    /// lie under the TLS directory; offending paths are reported together.
    pub fn volumes(mut self, volumes: BTreeMap<String, String>) -> Result<DesiredUnitBuilder> {
        let mut cleaned = BTreeMap::new();
        let mut rejected = Vec::new();
        for (host_path, container_path) in volumes {
            let normalized = lexical_clean(&host_path);
            if self.paths.is_under_tls_dir(&normalized) {
                cleaned.insert(normalized, container_path);
            } else {
                rejected.push(host_path);
            }
        }
        if !rejected.is_empty() {
            return Err(Error::Validation(format!(
                "volume host paths outside {}: {}",
                self.paths.tls_dir.display(),
                rejected.join(", ")
            )));
        }
        self.volumes = cleaned;
        Ok(self)
    }

    pub fn schedule(mut self, schedule: Option<String>) -> DesiredUnitBuilder {
        self.schedule = schedule.filter(|s| !s.is_empty());
        self
    }

    /// Run the cross-field rules and produce the unit.
    pub fn build(self) -> Result<DesiredUnit> {
        let path = self
            .path
            .ok_or_else(|| Error::Validation("unit path is required".into()))?;
        let kind = self
            .kind
            .ok_or_else(|| Error::Validation("unit type is required".into()))?;

        let container = if kind.uses_container() {
            let container = self.container.ok_or_else(|| {
                Error::Validation(format!("{kind} units require a container"))
            })?;
            if !container.image_name.starts_with(IMAGE_PREFIX) {
                return Err(Error::Validation(format!(
                    "container image {} is outside the allowed registry prefix {IMAGE_PREFIX}",
                    container.image_name
                )));
            }
            if container.image_tag.is_empty() {
                return Err(Error::Validation("container image tag is required".into()));
            }
            if kind == UnitType::Simple && container.name.is_empty() {
                return Err(Error::Validation(
                    "simple units require a container name".into(),
                ));
            }
            Some(container)
        } else {
            if let Some(container) = &self.container {
                if !container.name.is_empty()
                    || !container.image_name.is_empty()
                    || !container.image_tag.is_empty()
                {
                    return Err(Error::Validation(format!(
                        "{kind} units do not use a container"
                    )));
                }
            }
            None
        };

        match kind {
            UnitType::Timer => {
                if self.schedule.is_none() {
                    return Err(Error::Validation("timer units require a schedule".into()));
                }
            }
            _ => {
                if self.schedule.is_some() {
                    return Err(Error::Validation(format!(
                        "{kind} units do not take a schedule"
                    )));
                }
            }
        }

        Ok(DesiredUnit {
            id: self.id,
            path,
            kind,
            container,
            secrets: self.secrets,
            env: self.env,
            ports: self.ports,
            volumes: self.volumes,
            schedule: self.schedule,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> DesiredUnitBuilder {
        DesiredUnitBuilder::new(Paths::default())
    }

    fn web_container() -> ContainerSpec {
        ContainerSpec {
            name: "web".into(),
            image_name: "quay.io/berth/berth-web".into(),
            image_tag: "v1".into(),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn builds_a_valid_simple_unit() {
        let unit = builder()
            .path("/etc/systemd/system/berth-web.service")
            .unwrap()
            .kind(UnitType::Simple)
            .container(web_container())
            .env(BTreeMap::from([("PORT".into(), "8080".into())]))
            .build()
            .unwrap();
        assert_eq!(unit.unit_name(), "berth-web.service");
        assert_eq!(unit.container.as_ref().unwrap().name, "web");
    }

    #[test]
    fn rejects_paths_outside_the_unit_directory() {
        assert!(builder().path("/tmp/berth-web.service").is_err());
        assert!(builder().path("/etc/systemd/system/web.service").is_err());
        // Traversal does not escape the prefix check.
        assert!(builder()
            .path("/etc/systemd/system/../../tmp/berth-web.service")
            .is_err());
    }

    #[test]
    fn simple_units_require_a_named_container() {
        let err = builder()
            .path("/etc/systemd/system/berth-web.service")
            .unwrap()
            .kind(UnitType::Simple)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut anonymous = web_container();
        anonymous.name.clear();
        let err = builder()
            .path("/etc/systemd/system/berth-web.service")
            .unwrap()
            .kind(UnitType::Simple)
            .container(anonymous)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("container name"));
    }

    #[test]
    fn oneshot_units_allow_an_anonymous_container() {
        let mut anonymous = web_container();
        anonymous.name.clear();
        let unit = builder()
            .path("/etc/systemd/system/berth-migrate.service")
            .unwrap()
            .kind(UnitType::OneShot)
            .container(anonymous)
            .build()
            .unwrap();
        assert_eq!(unit.display_name(), "berth-migrate.service");
    }

    #[test]
    fn image_names_must_match_the_registry_prefix() {
        let mut foreign = web_container();
        foreign.image_name = "docker.io/library/nginx".into();
        let err = builder()
            .path("/etc/systemd/system/berth-web.service")
            .unwrap()
            .kind(UnitType::Simple)
            .container(foreign)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("registry prefix"));
    }

    #[test]
    fn timers_require_a_schedule_and_forbid_containers() {
        let err = builder()
            .path("/etc/systemd/system/berth-nightly.timer")
            .unwrap()
            .kind(UnitType::Timer)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("schedule"));

        let err = builder()
            .path("/etc/systemd/system/berth-nightly.timer")
            .unwrap()
            .kind(UnitType::Timer)
            .schedule(Some("*-*-* 03:00:00".into()))
            .container(web_container())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("do not use a container"));
    }

    #[test]
    fn coordinator_units_forbid_schedule_and_container() {
        let unit = builder()
            .path("/etc/systemd/system/berth-coordinator.service")
            .unwrap()
            .kind(UnitType::Coordinator)
            .build()
            .unwrap();
        assert!(unit.container.is_none());

        let err = builder()
            .path("/etc/systemd/system/berth-coordinator.service")
            .unwrap()
            .kind(UnitType::Coordinator)
            .schedule(Some("hourly".into()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("schedule"));
    }

    #[test]
    fn volume_host_paths_are_normalized_and_prefix_checked() {
        let built = builder()
            .path("/etc/systemd/system/berth-proxy.service")
            .unwrap()
            .kind(UnitType::Simple)
            .container(web_container())
            .volumes(BTreeMap::from([(
                "/etc/ssl/berth/../berth/fullchain.pem".into(),
                "/cert.pem".into(),
            )]))
            .unwrap()
            .build()
            .unwrap();
        assert!(built.volumes.contains_key("/etc/ssl/berth/fullchain.pem"));

        let err = builder()
            .volumes(BTreeMap::from([("/etc/passwd".into(), "/pw".into())]))
            .unwrap_err();
        assert!(err.to_string().contains("/etc/passwd"));
    }
}
