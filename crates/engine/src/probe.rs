//! Actual-state reads: unit files, TLS material, disk usage.

use std::collections::BTreeMap;

use berth_core::model::ActualUnit;
use berth_core::paths::{Paths, UNIT_PREFIX};
use berth_core::{Error, Result};
use tokio::process::Command;

/// Read every managed unit file under the unit directory.
///
/// Units are returned sorted by path so probing is deterministic.
pub async fn read_unit_files(paths: &Paths) -> Result<Vec<ActualUnit>> {
    let mut entries = tokio::fs::read_dir(&paths.unit_dir)
        .await
        .map_err(|e| Error::fs(&paths.unit_dir, e))?;

    let mut units = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::fs(&paths.unit_dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(UNIT_PREFIX) {
            continue;
        }
        let path = entry.path();
        if !entry
            .file_type()
            .await
            .map_err(|e| Error::fs(&path, e))?
            .is_file()
        {
            continue;
        }
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::fs(&path, e))?;
        units.push(ActualUnit {
            path: path.to_string_lossy().into_owned(),
            content,
            image_id: None,
        });
    }

    units.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(units)
}

/// Read the three TLS files; a missing file maps to `None`.
pub async fn read_tls_files(paths: &Paths) -> Result<BTreeMap<String, Option<Vec<u8>>>> {
    let mut files = BTreeMap::new();
    for (_, path) in paths.tls_files() {
        let content = match tokio::fs::read(&path).await {
            Ok(content) => Some(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(Error::fs(&path, err)),
        };
        files.insert(path.to_string_lossy().into_owned(), content);
    }
    Ok(files)
}

/// Usage percentage of the partition holding container storage, parsed from
/// a `df` report.
pub async fn read_disk_usage(paths: &Paths) -> Result<u8> {
    let output = Command::new("df")
        .arg(&paths.docker_partition)
        .output()
        .await
        .map_err(|e| Error::fs(&paths.docker_partition, e))?;

    if !output.status.success() {
        return Err(Error::Fs {
            path: paths.docker_partition.clone(),
            source: std::io::Error::other(format!(
                "df exited {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
            )),
        });
    }

    parse_df_percent(
        &String::from_utf8_lossy(&output.stdout),
        &paths.docker_partition,
    )
}

/// Extract the single `N%` field from df output. Zero or multiple matches
/// are errors: the report must be about exactly one partition.
fn parse_df_percent(report: &str, partition: &std::path::Path) -> Result<u8> {
    let re = regex::Regex::new(r"(\d+)%").expect("static regex compiles");
    let mut matches = re.captures_iter(report);

    let unparseable = |reason: &str| {
        Error::fs(
            partition,
            std::io::Error::other(format!("{reason} in df report: {report}")),
        )
    };

    let first = matches
        .next()
        .ok_or_else(|| unparseable("no usage percentage"))?;
    if matches.next().is_some() {
        return Err(unparseable("multiple usage percentages"));
    }

    first[1]
        .parse()
        .map_err(|_| unparseable("usage percentage out of range"))
}
