//! Deterministic rendering of desired units into systemd unit files.
//!
//! Rendered bytes are the basis for content diffing, so everything here is
//! part of the contract: line endings, the order of env/volume/port
//! directives (sorted by key), and the quoting of environment values.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::{Error, Result};
use crate::model::{ContainerSpec, DesiredUnit, UnitType};
use crate::secrets::SecretBag;

/// Render a desired unit to its unit-file text.
///
/// `argv0` is the absolute path of the coordinator binary, used only by the
/// Self template. Secret keys listed on the unit are resolved through the
/// bag into environment entries alongside `unit.env`.
pub fn render_unit(unit: &DesiredUnit, bag: &SecretBag, argv0: &str) -> Result<String> {
    let env = resolve_env(unit, bag)?;
    match unit.kind {
        UnitType::Simple => render_simple(unit, &env),
        UnitType::OneShot => render_one_shot(unit, &env),
        UnitType::Timer => render_timer(unit),
        UnitType::Coordinator => Ok(render_coordinator(&env, argv0)),
    }
}

/// Merge `unit.env` with the unit's secrets, escaping embedded newlines as a
/// `\n` escape plus a literal line continuation so multi-line values survive
/// systemd's parser.
fn resolve_env(unit: &DesiredUnit, bag: &SecretBag) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for (key, value) in &unit.env {
        env.insert(key.clone(), escape_newlines(value));
    }
    for key in &unit.secrets {
        let value = bag.get_required(key)?;
        env.insert(key.clone(), escape_newlines(value));
    }
    Ok(env)
}

fn escape_newlines(value: &str) -> String {
    value.replace('\n', "\\n\\\n")
}

fn container_of<'a>(unit: &'a DesiredUnit) -> Result<&'a ContainerSpec> {
    unit.container
        .as_ref()
        .ok_or_else(|| Error::render(unit.unit_name(), "unit has no container descriptor"))
}

fn render_simple(unit: &DesiredUnit, env: &BTreeMap<String, String>) -> Result<String> {
    let container = container_of(unit)?;
    let mut out = String::new();
    let _ = write!(
        out,
        "[Unit]\n\
         Description={display}\n\
         After=docker.service\n\
         Requires=docker.service\n\
         \n\
         [Service]\n\
         ExecStartPre=-/usr/bin/docker kill {name}\n\
         ExecStartPre=-/usr/bin/docker rm {name}\n\
         ExecStart=/usr/bin/docker run \\\n  --read-only \\\n  --network local \\\n",
        display = unit.display_name(),
        name = container.name,
    );
    write_run_flags(&mut out, unit, env);
    let _ = write!(
        out,
        "  --name {name} \\\n  {image}\n\n[Install]\nWantedBy=multi-user.target\n",
        name = container.name,
        image = container.image_ref(),
    );
    Ok(out)
}

fn render_one_shot(unit: &DesiredUnit, env: &BTreeMap<String, String>) -> Result<String> {
    let container = container_of(unit)?;
    let mut out = String::new();
    let _ = write!(
        out,
        "[Unit]\n\
         Description={display}\n\
         Requires=docker.service\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart=/usr/bin/docker run --rm \\\n  --read-only \\\n",
        display = unit.display_name(),
    );
    write_run_flags(&mut out, unit, env);
    let _ = write!(out, "  {image}\n", image = container.image_ref());
    Ok(out)
}

fn render_timer(unit: &DesiredUnit) -> Result<String> {
    let schedule = unit
        .schedule
        .as_deref()
        .ok_or_else(|| Error::render(unit.unit_name(), "timer unit has no schedule"))?;
    Ok(format!(
        "[Unit]\n\
         Description={display}\n\
         \n\
         [Timer]\n\
         OnCalendar={schedule}\n\
         \n\
         [Install]\n\
         WantedBy=timers.target\n",
        display = unit.display_name(),
    ))
}

fn render_coordinator(env: &BTreeMap<String, String>, argv0: &str) -> String {
    let mut out = String::from(
        "[Unit]\n\
         Description=berth\n\
         After=docker.service\n\
         Wants=docker.service\n\
         \n\
         [Service]\n\
         User=berth\n\
         Restart=always\n",
    );
    for (key, value) in env {
        let _ = writeln!(out, "Environment=\"{key}={value}\"");
    }
    let _ = write!(
        out,
        "ExecStart={argv0} serve\n\n[Install]\nWantedBy=multi-user.target\n"
    );
    out
}

/// Shared `docker run` flag block: env, volumes (read-only), published
/// ports, each sorted by key.
fn write_run_flags(out: &mut String, unit: &DesiredUnit, env: &BTreeMap<String, String>) {
    for (key, value) in env {
        let _ = writeln!(out, "  --env {key}=\"{value}\" \\");
    }
    for (host_path, container_path) in &unit.volumes {
        let _ = writeln!(out, "  --volume {host_path}:{container_path}:ro \\");
    }
    for (host_port, container_port) in &unit.ports {
        let _ = writeln!(out, "  --publish {host_port}:{container_port} \\");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DesiredUnitBuilder;
    use crate::paths::Paths;

    fn web_unit() -> DesiredUnit {
        DesiredUnitBuilder::new(Paths::default())
            .path("/etc/systemd/system/berth-web.service")
            .unwrap()
            .kind(UnitType::Simple)
            .container(ContainerSpec {
                name: "web".into(),
                image_name: "quay.io/berth/berth-web".into(),
                image_tag: "v1".into(),
                ..ContainerSpec::default()
            })
            .env(BTreeMap::from([
                ("PORT".into(), "8080".into()),
                ("A_FIRST".into(), "yes".into()),
            ]))
            .ports(BTreeMap::from([(443, 8443)]))
            .volumes(BTreeMap::from([(
                "/etc/ssl/berth/fullchain.pem".into(),
                "/cert.pem".into(),
            )]))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn simple_unit_renders_the_full_run_invocation() {
        let rendered = render_unit(&web_unit(), &SecretBag::new(), "/usr/bin/berth").unwrap();
        let expected = "\
[Unit]
Description=web
After=docker.service
Requires=docker.service

[Service]
ExecStartPre=-/usr/bin/docker kill web
ExecStartPre=-/usr/bin/docker rm web
ExecStart=/usr/bin/docker run \\
  --read-only \\
  --network local \\
  --env A_FIRST=\"yes\" \\
  --env PORT=\"8080\" \\
  --volume /etc/ssl/berth/fullchain.pem:/cert.pem:ro \\
  --publish 443:8443 \\
  --name web \\
  quay.io/berth/berth-web:v1

[Install]
WantedBy=multi-user.target
";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn rendering_is_deterministic() {
        let bag = SecretBag::new();
        let first = render_unit(&web_unit(), &bag, "/usr/bin/berth").unwrap();
        let second = render_unit(&web_unit(), &bag, "/usr/bin/berth").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn secrets_resolve_into_environment_entries() {
        let mut unit = web_unit();
        unit.secrets = vec!["API_TOKEN".into()];
        let mut bag = SecretBag::new();
        bag.set("API_TOKEN", "hunter2");
        let rendered = render_unit(&unit, &bag, "/usr/bin/berth").unwrap();
        assert!(rendered.contains("  --env API_TOKEN=\"hunter2\" \\\n"));
    }

    #[test]
    fn missing_secret_fails_the_render() {
        let mut unit = web_unit();
        unit.secrets = vec!["ABSENT".into()];
        let err = render_unit(&unit, &SecretBag::new(), "/usr/bin/berth").unwrap_err();
        assert!(matches!(err, Error::MissingSecret(key) if key == "ABSENT"));
    }

    #[test]
    fn embedded_newlines_become_line_continuations() {
        let mut unit = web_unit();
        unit.env = BTreeMap::from([("PEM".into(), "line1\nline2".into())]);
        let rendered = render_unit(&unit, &SecretBag::new(), "/usr/bin/berth").unwrap();
        assert!(rendered.contains("--env PEM=\"line1\\n\\\nline2\""));
    }

    #[test]
    fn oneshot_units_omit_name_and_install_section() {
        let unit = DesiredUnitBuilder::new(Paths::default())
            .path("/etc/systemd/system/berth-migrate.service")
            .unwrap()
            .kind(UnitType::OneShot)
            .container(ContainerSpec {
                name: String::new(),
                image_name: "quay.io/berth/berth-migrate".into(),
                image_tag: "v2".into(),
                ..ContainerSpec::default()
            })
            .build()
            .unwrap();
        let rendered = render_unit(&unit, &SecretBag::new(), "/usr/bin/berth").unwrap();
        assert!(rendered.contains("Type=oneshot\n"));
        assert!(rendered.contains("docker run --rm"));
        assert!(!rendered.contains("--name"));
        assert!(!rendered.contains("[Install]"));
        assert!(rendered.ends_with("  quay.io/berth/berth-migrate:v2\n"));
    }

    #[test]
    fn timer_units_render_the_calendar_expression() {
        let unit = DesiredUnitBuilder::new(Paths::default())
            .path("/etc/systemd/system/berth-nightly.timer")
            .unwrap()
            .kind(UnitType::Timer)
            .schedule(Some("*-*-* 03:00:00".into()))
            .build()
            .unwrap();
        let rendered = render_unit(&unit, &SecretBag::new(), "/usr/bin/berth").unwrap();
        assert!(rendered.contains("OnCalendar=*-*-* 03:00:00\n"));
        assert!(rendered.contains("WantedBy=timers.target\n"));
    }

    #[test]
    fn coordinator_unit_embeds_argv0_and_restart_policy() {
        let unit = DesiredUnitBuilder::new(Paths::default())
            .path("/etc/systemd/system/berth-coordinator.service")
            .unwrap()
            .kind(UnitType::Coordinator)
            .env(BTreeMap::from([("RUST_LOG".into(), "info".into())]))
            .build()
            .unwrap();
        let rendered = render_unit(&unit, &SecretBag::new(), "/opt/berth/bin/berth").unwrap();
        assert!(rendered.contains("ExecStart=/opt/berth/bin/berth serve\n"));
        assert!(rendered.contains("Environment=\"RUST_LOG=info\"\n"));
        // The coordinator must come back up on its self-restart exit.
        assert!(rendered.contains("Restart=always\n"));
    }
}
