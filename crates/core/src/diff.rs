//! Pure computation of the change plan between desired and actual state.
//!
//! [`compute`] is deterministic given its inputs and performs no I/O; it is
//! the property-test anchor of the whole system.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ActualState, ActualUnit, DesiredState, DesiredUnit, UpdatedContainer};
use crate::paths::Paths;
use crate::render::render_unit;
use crate::secrets::SecretBag;

/// The typed change plan produced by [`compute`].
///
/// A `Delta` is a plain value: it carries no connections and serializes
/// freely. The applier receives the delta and a session as independent
/// arguments.
///
/// Invariants maintained by [`compute`]:
/// - every logical unit name appears in at most one of the four unit
///   collections;
/// - the keys of the internal content map equal `files_to_write`;
/// - `updated_containers` records exactly the units in `units_to_change`
///   whose container image drifted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Desired units with no actual counterpart by logical name.
    pub units_to_add: Vec<DesiredUnit>,
    /// Desired units whose rendered text or container image id differs from
    /// the actual unit. Applying rewrites the file, reloads, and restarts.
    pub units_to_change: Vec<DesiredUnit>,
    /// Desired units whose text is unchanged but whose runtime should be
    /// cycled: a volume-mounted file is being rewritten, or the container is
    /// not running.
    pub units_to_restart: Vec<DesiredUnit>,
    /// Actual units with no matching desired unit.
    pub units_to_remove: Vec<ActualUnit>,
    /// Paths whose on-disk bytes differ from the desired bytes.
    pub files_to_write: Vec<String>,
    /// Provenance for the changed units whose container image drifted.
    pub updated_containers: Vec<UpdatedContainer>,
    /// True when applying this delta rewrites TLS material, which requires
    /// the coordinator itself to restart under the new certificates.
    pub coordinator_restart_needed: bool,

    #[serde(skip)]
    file_content: BTreeMap<String, Vec<u8>>,
}

impl Delta {
    /// True when applying would perform no mutation at all.
    pub fn is_empty(&self) -> bool {
        self.units_to_add.is_empty()
            && self.units_to_change.is_empty()
            && self.units_to_restart.is_empty()
            && self.units_to_remove.is_empty()
            && self.files_to_write.is_empty()
    }

    /// Desired bytes for each path in `files_to_write`, in path order.
    pub fn file_contents(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.file_content
            .iter()
            .map(|(path, bytes)| (path.as_str(), bytes.as_slice()))
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let describe = |unit: &DesiredUnit| match &unit.container {
            Some(c) if !c.image_name.is_empty() && !c.image_tag.is_empty() => {
                format!("{} container=({})", unit.path, c.image_ref())
            }
            _ => unit.path.clone(),
        };
        for unit in &self.units_to_add {
            writeln!(f, "add unit: {}", describe(unit))?;
        }
        for unit in &self.units_to_change {
            writeln!(f, "change unit: {}", describe(unit))?;
        }
        for unit in &self.units_to_restart {
            writeln!(f, "restart unit: {}", describe(unit))?;
        }
        for unit in &self.units_to_remove {
            writeln!(f, "remove unit: {} contentlen={}", unit.path, unit.content.len())?;
        }
        for path in &self.files_to_write {
            let len = self.file_content.get(path).map_or(0, Vec::len);
            writeln!(f, "write file: {path} contentlen={len}")?;
        }
        if self.coordinator_restart_needed {
            writeln!(f, "coordinator restart needed")?;
        }
        Ok(())
    }
}

/// Compare desired and actual state and produce the delta that converts the
/// latter into the former.
///
/// Units whose rendering fails are warned about and left out of every
/// bucket; a later reconciliation picks them up once the render input (most
/// often a missing secret) is corrected.
pub fn compute(
    desired: &DesiredState,
    actual: &ActualState,
    bag: &SecretBag,
    paths: &Paths,
    argv0: &str,
) -> Delta {
    let mut delta = Delta::default();

    for (path, desired_content) in &desired.files {
        match actual.files.get(path) {
            Some(Some(existing)) if existing == desired_content => {
                tracing::debug!(path, "File already matches.");
            }
            _ => {
                tracing::debug!(path, "File is absent or different.");
                delta.files_to_write.push(path.clone());
                delta
                    .file_content
                    .insert(path.clone(), desired_content.clone());
            }
        }
    }

    let mut desired_by_name: BTreeMap<&str, &DesiredUnit> = BTreeMap::new();
    for unit in &desired.units {
        desired_by_name.insert(unit.unit_name(), unit);
    }
    let mut matched: Vec<&str> = Vec::new();

    for actual_unit in &actual.units {
        let name = actual_unit.unit_name();
        let Some(unit) = desired_by_name.get(name).copied() else {
            tracing::debug!(unit = name, "Unit is no longer desired.");
            delta.units_to_remove.push(actual_unit.clone());
            continue;
        };
        matched.push(name);

        let rendered = match render_unit(unit, bag, argv0) {
            Ok(rendered) => rendered,
            Err(err) => {
                tracing::warn!(unit = name, error = %err, "Unable to render expected unit file contents.");
                continue;
            }
        };

        let text_changed = rendered.as_bytes() != actual_unit.content.as_slice();

        let image_drift = match (&unit.container, &actual_unit.image_id) {
            (Some(container), Some(actual_id)) => container
                .image_id
                .as_deref()
                .is_some_and(|id| !id.is_empty() && id != actual_id),
            _ => false,
        };

        // A named container that is not running has no image id to compare;
        // cycling the unit brings it back up.
        let container_missing = unit
            .container
            .as_ref()
            .is_some_and(|c| !c.name.is_empty())
            && actual_unit.image_id.is_none();

        let volume_touched = unit
            .volumes
            .keys()
            .any(|host_path| delta.file_content.contains_key(host_path));

        if text_changed || image_drift {
            tracing::debug!(
                unit = name,
                text_changed,
                image_drift,
                "Unit requires a rewrite.",
            );
            if image_drift {
                if let Some(container) = &unit.container {
                    delta
                        .updated_containers
                        .push(UpdatedContainer::from_unit(unit, container));
                }
            }
            delta.units_to_change.push(unit.clone());
        } else if volume_touched || container_missing {
            tracing::debug!(
                unit = name,
                volume_touched,
                container_missing,
                "Unit requires a restart.",
            );
            delta.units_to_restart.push(unit.clone());
        } else {
            tracing::debug!(unit = name, "Nothing to do.");
        }
    }

    for unit in &desired.units {
        let name = unit.unit_name();
        if desired_by_name.contains_key(name) && !matched.contains(&name) {
            tracing::debug!(unit = name, "Unit is not yet present.");
            delta.units_to_add.push(unit.clone());
            // Guard against a duplicate desired path producing two adds.
            desired_by_name.remove(name);
        }
    }

    delta.coordinator_restart_needed = delta
        .files_to_write
        .iter()
        .any(|path| paths.is_tls_file(path));

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DesiredUnitBuilder;
    use crate::model::{ContainerSpec, UnitType};
    use crate::paths::{KEY_TLS_CERTIFICATE, KEY_TLS_DH_PARAMS, KEY_TLS_KEY};

    const ARGV0: &str = "/usr/bin/berth";

    fn tls_bag() -> SecretBag {
        let mut bag = SecretBag::new();
        bag.set(KEY_TLS_CERTIFICATE, "CERT");
        bag.set(KEY_TLS_KEY, "KEY");
        bag.set(KEY_TLS_DH_PARAMS, "DH");
        bag
    }

    fn web_unit(image_id: Option<&str>) -> DesiredUnit {
        let mut unit = DesiredUnitBuilder::new(Paths::default())
            .path("/etc/systemd/system/berth-web.service")
            .unwrap()
            .kind(UnitType::Simple)
            .container(ContainerSpec {
                name: "web".into(),
                image_name: "quay.io/berth/berth-web".into(),
                image_tag: "v1".into(),
                ..ContainerSpec::default()
            })
            .env(std::collections::BTreeMap::from([(
                "PORT".into(),
                "8080".into(),
            )]))
            .build()
            .unwrap();
        if let Some(id) = image_id {
            unit.container.as_mut().unwrap().image_id = Some(id.into());
        }
        unit
    }

    fn actual_for(unit: &DesiredUnit, bag: &SecretBag, image_id: Option<&str>) -> ActualUnit {
        ActualUnit {
            path: unit.path.clone(),
            content: render_unit(unit, bag, ARGV0).unwrap().into_bytes(),
            image_id: image_id.map(String::from),
        }
    }

    fn matching_files(desired: &DesiredState) -> BTreeMap<String, Option<Vec<u8>>> {
        desired
            .files
            .iter()
            .map(|(path, content)| (path.clone(), Some(content.clone())))
            .collect()
    }

    // Seed scenario 1: a new Simple unit on an empty host.
    #[test]
    fn new_unit_lands_in_units_to_add() {
        let bag = tls_bag();
        let paths = Paths::default();
        let desired = DesiredState {
            units: vec![web_unit(None)],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let actual = ActualState {
            units: vec![],
            files: matching_files(&desired),
        };

        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
        assert_eq!(delta.units_to_add.len(), 1);
        assert_eq!(delta.units_to_add[0].unit_name(), "berth-web.service");
        assert!(delta.units_to_change.is_empty());
        assert!(delta.files_to_write.is_empty());
        assert!(!delta.coordinator_restart_needed);
    }

    // Seed scenario 2: rotated TLS material forces a coordinator restart.
    #[test]
    fn tls_rotation_sets_the_coordinator_restart_flag() {
        let bag = tls_bag();
        let paths = Paths::default();
        let desired = DesiredState {
            units: vec![],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let stale = desired
            .files
            .keys()
            .map(|path| (path.clone(), Some(b"OLD".to_vec())))
            .collect();
        let actual = ActualState {
            units: vec![],
            files: stale,
        };

        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
        assert_eq!(delta.files_to_write.len(), 3);
        assert!(delta.coordinator_restart_needed);
    }

    // Seed scenario 3: rewriting a mounted file restarts its consumer.
    #[test]
    fn mounted_file_change_restarts_the_consuming_unit() {
        let bag = tls_bag();
        let paths = Paths::default();
        let mut proxy = DesiredUnitBuilder::new(Paths::default())
            .path("/etc/systemd/system/berth-proxy.service")
            .unwrap()
            .kind(UnitType::Simple)
            .container(ContainerSpec {
                name: "proxy".into(),
                image_name: "quay.io/berth/berth-proxy".into(),
                image_tag: "v1".into(),
                ..ContainerSpec::default()
            })
            .volumes(std::collections::BTreeMap::from([(
                "/etc/ssl/berth/fullchain.pem".into(),
                "/cert.pem".into(),
            )]))
            .unwrap()
            .build()
            .unwrap();
        proxy.container.as_mut().unwrap().image_id = Some("sha256:abc".into());

        let desired = DesiredState {
            units: vec![proxy.clone()],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let mut files = matching_files(&desired);
        files.insert(
            "/etc/ssl/berth/fullchain.pem".into(),
            Some(b"EXPIRED".to_vec()),
        );
        let actual = ActualState {
            units: vec![actual_for(&proxy, &bag, Some("sha256:abc"))],
            files,
        };

        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
        assert!(delta
            .files_to_write
            .contains(&"/etc/ssl/berth/fullchain.pem".to_string()));
        assert_eq!(delta.units_to_restart.len(), 1);
        assert_eq!(delta.units_to_restart[0].unit_name(), "berth-proxy.service");
        assert!(delta.units_to_change.is_empty());
    }

    // Seed scenario 4: image drift with identical text forces change+restart.
    #[test]
    fn image_drift_forces_a_change_with_provenance() {
        let bag = tls_bag();
        let paths = Paths::default();
        let unit = web_unit(Some("sha256:abc"));
        let desired = DesiredState {
            units: vec![unit.clone()],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let actual = ActualState {
            units: vec![actual_for(&unit, &bag, Some("sha256:def"))],
            files: matching_files(&desired),
        };

        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
        assert_eq!(delta.units_to_change.len(), 1);
        assert_eq!(delta.updated_containers.len(), 1);
        assert_eq!(delta.updated_containers[0].unit_name, "berth-web.service");
        assert!(delta.units_to_restart.is_empty());
        assert!(delta.units_to_add.is_empty());
    }

    #[test]
    fn missing_container_cycles_the_unit() {
        let bag = tls_bag();
        let paths = Paths::default();
        let unit = web_unit(Some("sha256:abc"));
        let desired = DesiredState {
            units: vec![unit.clone()],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let actual = ActualState {
            units: vec![actual_for(&unit, &bag, None)],
            files: matching_files(&desired),
        };

        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
        assert_eq!(delta.units_to_restart.len(), 1);
        assert!(delta.units_to_change.is_empty());
    }

    #[test]
    fn undesired_units_are_removed() {
        let bag = tls_bag();
        let paths = Paths::default();
        let desired = DesiredState {
            units: vec![],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let orphan = ActualUnit {
            path: "/etc/systemd/system/berth-old.service".into(),
            content: b"[Unit]\n".to_vec(),
            image_id: None,
        };
        let actual = ActualState {
            units: vec![orphan],
            files: matching_files(&desired),
        };

        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
        assert_eq!(delta.units_to_remove.len(), 1);
        assert_eq!(delta.units_to_remove[0].unit_name(), "berth-old.service");
    }

    #[test]
    fn render_failure_skips_the_unit_entirely() {
        let bag = tls_bag();
        let paths = Paths::default();
        let mut unit = web_unit(None);
        unit.secrets = vec!["ABSENT_SECRET".into()];
        let desired = DesiredState {
            units: vec![unit.clone()],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let actual = ActualState {
            units: vec![ActualUnit {
                path: unit.path.clone(),
                content: b"stale".to_vec(),
                image_id: Some("sha256:abc".into()),
            }],
            files: matching_files(&desired),
        };

        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
        assert!(delta.units_to_add.is_empty());
        assert!(delta.units_to_change.is_empty());
        assert!(delta.units_to_restart.is_empty());
        assert!(delta.units_to_remove.is_empty());
    }

    #[test]
    fn delta_serializes_without_the_content_map() {
        let bag = tls_bag();
        let paths = Paths::default();
        let desired = DesiredState {
            units: vec![],
            files: bag.desired_tls_files(&paths).unwrap(),
        };
        let actual = ActualState::default();
        let delta = compute(&desired, &actual, &bag, &paths, ARGV0);

        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["files_to_write"].as_array().unwrap().len(), 3);
        assert!(json.get("file_content").is_none());
        assert_eq!(json["coordinator_restart_needed"], true);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const NAMES: [&str; 4] = [
            "berth-a.service",
            "berth-b.service",
            "berth-c.service",
            "berth-d.service",
        ];

        #[derive(Debug, Clone)]
        enum ActualShape {
            Absent,
            Matching { image_drift: bool },
            StaleText,
            ContainerGone,
        }

        fn arb_shape() -> impl Strategy<Value = ActualShape> {
            prop_oneof![
                Just(ActualShape::Absent),
                Just(ActualShape::Matching { image_drift: false }),
                Just(ActualShape::Matching { image_drift: true }),
                Just(ActualShape::StaleText),
                Just(ActualShape::ContainerGone),
            ]
        }

        fn arb_world(
        ) -> impl Strategy<Value = (DesiredState, ActualState, SecretBag, Paths)> {
            (
                proptest::collection::vec(arb_shape(), NAMES.len()),
                proptest::collection::vec(any::<bool>(), 3),
                any::<bool>(),
                proptest::collection::vec(any::<bool>(), NAMES.len()),
            )
                .prop_map(|(shapes, tls_fresh, orphan, mounts_cert)| {
                    let bag = tls_bag();
                    let paths = Paths::default();
                    let mut desired_units = Vec::new();
                    let mut actual_units = Vec::new();

                    for ((name, shape), mounts) in
                        NAMES.iter().zip(&shapes).zip(&mounts_cert)
                    {
                        let mut builder = DesiredUnitBuilder::new(paths.clone())
                            .path(&format!("/etc/systemd/system/{name}"))
                            .unwrap()
                            .kind(UnitType::Simple)
                            .container(ContainerSpec {
                                name: name.trim_end_matches(".service").into(),
                                image_name: format!("quay.io/berth/{name}"),
                                image_tag: "v1".into(),
                                image_id: Some("sha256:desired".into()),
                                ..ContainerSpec::default()
                            });
                        if *mounts {
                            builder = builder
                                .volumes(std::collections::BTreeMap::from([(
                                    "/etc/ssl/berth/fullchain.pem".to_string(),
                                    "/cert.pem".to_string(),
                                )]))
                                .unwrap();
                        }
                        let unit = builder.build().unwrap();

                        match shape {
                            ActualShape::Absent => {}
                            ActualShape::Matching { image_drift } => {
                                let id = if *image_drift {
                                    "sha256:other"
                                } else {
                                    "sha256:desired"
                                };
                                actual_units.push(actual_for(&unit, &bag, Some(id)));
                            }
                            ActualShape::StaleText => {
                                actual_units.push(ActualUnit {
                                    path: unit.path.clone(),
                                    content: b"stale".to_vec(),
                                    image_id: Some("sha256:desired".into()),
                                });
                            }
                            ActualShape::ContainerGone => {
                                actual_units.push(actual_for(&unit, &bag, None));
                            }
                        }
                        desired_units.push(unit);
                    }

                    if orphan {
                        actual_units.push(ActualUnit {
                            path: "/etc/systemd/system/berth-orphan.service".into(),
                            content: b"[Unit]\n".to_vec(),
                            image_id: None,
                        });
                    }

                    let desired = DesiredState {
                        units: desired_units,
                        files: bag.desired_tls_files(&paths).unwrap(),
                    };
                    let actual_files = desired
                        .files
                        .iter()
                        .zip(&tls_fresh)
                        .map(|((path, content), fresh)| {
                            let bytes = if *fresh {
                                Some(content.clone())
                            } else {
                                Some(b"OLD".to_vec())
                            };
                            (path.clone(), bytes)
                        })
                        .collect();
                    let actual = ActualState {
                        units: actual_units,
                        files: actual_files,
                    };
                    (desired, actual, bag, paths)
                })
        }

        proptest! {
            // Diff partition: no unit name lands in more than one bucket,
            // and every bucketed name exists on one side of the diff.
            #[test]
            fn buckets_partition_unit_names((desired, actual, bag, paths) in arb_world()) {
                let delta = compute(&desired, &actual, &bag, &paths, ARGV0);

                let mut seen = std::collections::BTreeSet::new();
                let names = delta
                    .units_to_add
                    .iter()
                    .map(|u| u.unit_name())
                    .chain(delta.units_to_change.iter().map(|u| u.unit_name()))
                    .chain(delta.units_to_restart.iter().map(|u| u.unit_name()))
                    .chain(delta.units_to_remove.iter().map(|u| u.unit_name()));
                for name in names {
                    prop_assert!(seen.insert(name), "unit {name} appears in two buckets");
                }

                let known: std::collections::BTreeSet<&str> = desired
                    .units
                    .iter()
                    .map(|u| u.unit_name())
                    .chain(actual.units.iter().map(|u| u.unit_name()))
                    .collect();
                for name in &seen {
                    prop_assert!(known.contains(name));
                }
            }

            // Restart propagation: touching a mounted file cycles every
            // consumer that is not already being rewritten.
            #[test]
            fn mounted_file_writes_propagate_restarts((desired, actual, bag, paths) in arb_world()) {
                let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
                let present: std::collections::BTreeSet<&str> =
                    actual.units.iter().map(|u| u.unit_name()).collect();

                for unit in &desired.units {
                    let touched = unit
                        .volumes
                        .keys()
                        .any(|path| delta.files_to_write.contains(path));
                    if touched && present.contains(unit.unit_name()) {
                        let name = unit.unit_name();
                        let cycled = delta.units_to_restart.iter().any(|u| u.unit_name() == name)
                            || delta.units_to_change.iter().any(|u| u.unit_name() == name);
                        prop_assert!(cycled, "unit {name} mounts a rewritten file but is not cycled");
                    }
                }
            }

            // Self-restart gate: the flag is exactly "some TLS file will be
            // written".
            #[test]
            fn coordinator_restart_tracks_tls_writes((desired, actual, bag, paths) in arb_world()) {
                let delta = compute(&desired, &actual, &bag, &paths, ARGV0);
                let writes_tls = delta.files_to_write.iter().any(|p| paths.is_tls_file(p));
                prop_assert_eq!(delta.coordinator_restart_needed, writes_tls);
            }

            // Determinism: the differ is a pure function of its inputs.
            #[test]
            fn compute_is_deterministic((desired, actual, bag, paths) in arb_world()) {
                let first = compute(&desired, &actual, &bag, &paths, ARGV0);
                let second = compute(&desired, &actual, &bag, &paths, ARGV0);
                prop_assert_eq!(first, second);
            }
        }
    }
}
