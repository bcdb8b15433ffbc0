//! Container-runtime operations over the Docker Engine API.

use std::collections::{BTreeSet, HashMap};

use berth_core::model::DesiredState;
use berth_core::progress::Reporter;
use berth_core::{Error, Result};
use bollard::container::{InspectContainerOptions, PruneContainersOptions};
use bollard::image::{CreateImageOptions, ListImagesOptions, PruneImagesOptions};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use futures::StreamExt;

/// OCI image labels carrying build provenance.
const LABEL_SOURCE: &str = "org.opencontainers.image.source";
const LABEL_REVISION: &str = "org.opencontainers.image.revision";
const LABEL_REF: &str = "org.opencontainers.image.ref.name";

/// Name of the bridge network that berth-managed containers join.
const NETWORK_NAME: &str = "local";

/// Connect to the local Docker daemon, pinning the API version when the
/// configuration requests one.
pub fn connect(api_version: Option<&str>) -> Result<Docker> {
    let version = match api_version {
        Some(raw) => parse_api_version(raw)?,
        None => *API_DEFAULT_VERSION,
    };
    Docker::connect_with_unix("unix:///var/run/docker.sock", 120, &version)
        .map_err(Error::container)
}

fn parse_api_version(raw: &str) -> Result<ClientVersion> {
    let mut parts = raw.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major_version), Some(minor_version)) => Ok(ClientVersion {
            major_version,
            minor_version,
        }),
        _ => Err(Error::Config(format!(
            "docker_api_version {raw} is not MAJOR.MINOR"
        ))),
    }
}

/// Pull the latest version of every image referenced by a desired unit.
///
/// One task per distinct `name:tag`; each task posts exactly one completion
/// on a channel sized to the batch, so the drain below always terminates.
/// Errors are aggregated, never short-circuited.
pub async fn pull_all_images(
    docker: &Docker,
    desired: &DesiredState,
    reporter: &Reporter,
) -> Vec<Error> {
    let refs: BTreeSet<String> = desired
        .units
        .iter()
        .filter_map(|unit| unit.container.as_ref())
        .filter(|c| !c.image_name.is_empty() && !c.image_tag.is_empty())
        .map(|c| c.image_ref())
        .collect();

    if refs.is_empty() {
        return Vec::new();
    }
    reporter.report(
        "Beginning image pulls.",
        serde_json::json!({ "count": refs.len() }),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Option<Error>>(refs.len());
    for image_ref in refs {
        let docker = docker.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = pull_image(&docker, &image_ref).await.err();
            let _ = tx.send(outcome).await;
        });
    }
    drop(tx);

    let mut errs = Vec::new();
    while let Some(outcome) = rx.recv().await {
        if let Some(err) = outcome {
            errs.push(err);
        }
    }
    reporter.note("Image pulls complete.");
    errs
}

/// Pull one image reference, reading the progress stream to EOF.
async fn pull_image(docker: &Docker, image_ref: &str) -> Result<()> {
    let options = CreateImageOptions {
        from_image: image_ref.to_string(),
        ..Default::default()
    };
    let mut stream = docker.create_image(Some(options), None, None);

    let mut updated = false;
    while let Some(progress) = stream.next().await {
        let info = progress.map_err(Error::container)?;
        if let Some(status) = info.status.as_deref() {
            if status.contains("Downloaded newer image") {
                updated = true;
            }
        }
    }

    if updated {
        tracing::info!(image = image_ref, "Container image updated.");
    } else {
        tracing::debug!(image = image_ref, "Container image already current.");
    }
    Ok(())
}

/// Resolve the image id for every desired container by listing local images
/// matching `name:tag` and taking the newest by creation timestamp, then
/// read build provenance from the chosen image's labels.
///
/// Units whose images cannot be resolved are left with `image_id = None`;
/// the errors are aggregated so the reconciliation can continue with
/// whatever ids are known.
pub async fn resolve_image_ids(docker: &Docker, desired: &mut DesiredState) -> Vec<Error> {
    let mut errs = Vec::new();
    for unit in &mut desired.units {
        let Some(container) = unit.container.as_mut() else {
            continue;
        };
        if container.image_name.is_empty() || container.image_tag.is_empty() {
            continue;
        }

        let filters = HashMap::from([("reference".to_string(), vec![container.image_ref()])]);
        let summaries = match docker
            .list_images(Some(ListImagesOptions {
                filters,
                ..Default::default()
            }))
            .await
        {
            Ok(summaries) => summaries,
            Err(err) => {
                errs.push(Error::container(err));
                continue;
            }
        };

        // Greatest creation timestamp wins when several images share the
        // tag. Observable behavior; preserved as-is.
        let newest = summaries.into_iter().max_by_key(|summary| summary.created);
        let Some(newest) = newest else {
            tracing::warn!(image = %container.image_ref(), "No local image matches the reference.");
            continue;
        };

        container.image_id = Some(newest.id.clone());
        container.repository = newest.labels.get(LABEL_SOURCE).cloned();
        container.commit = newest.labels.get(LABEL_REVISION).cloned();
        container.git_ref = newest.labels.get(LABEL_REF).cloned();
    }
    errs
}

/// Image id of the running container with the given name, or `None` when no
/// such container exists.
pub async fn running_image_id(docker: &Docker, container_name: &str) -> Result<Option<String>> {
    match docker
        .inspect_container(container_name, None::<InspectContainerOptions>)
        .await
    {
        Ok(response) => Ok(response.image),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(None),
        Err(err) => Err(Error::container(err)),
    }
}

/// Ensure the bridge network that managed containers join exists.
pub async fn ensure_network(docker: &Docker) -> Result<()> {
    let networks = docker
        .list_networks(None::<ListNetworksOptions<String>>)
        .await
        .map_err(Error::container)?;

    if networks
        .iter()
        .any(|network| network.name.as_deref() == Some(NETWORK_NAME))
    {
        tracing::debug!(network = NETWORK_NAME, "Network already exists.");
        return Ok(());
    }

    let response = docker
        .create_network(CreateNetworkOptions {
            name: NETWORK_NAME.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        })
        .await
        .map_err(Error::container)?;
    tracing::info!(network = NETWORK_NAME, id = ?response.id, "Network created.");
    Ok(())
}

/// Remove stopped containers and dangling images to reclaim disk space.
pub async fn prune(docker: &Docker) {
    match docker
        .prune_containers(None::<PruneContainersOptions<String>>)
        .await
    {
        Ok(report) => tracing::debug!(
            containers = report.containers_deleted.map(|c| c.len()).unwrap_or(0),
            space_reclaimed = report.space_reclaimed,
            "Containers pruned.",
        ),
        Err(err) => tracing::warn!(error = %err, "Unable to prune containers."),
    }

    match docker.prune_images(None::<PruneImagesOptions<String>>).await {
        Ok(report) => tracing::debug!(
            images = report.images_deleted.map(|i| i.len()).unwrap_or(0),
            space_reclaimed = report.space_reclaimed,
            "Images pruned.",
        ),
        Err(err) => tracing::warn!(error = %err, "Unable to prune images."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_versions_parse_as_major_minor() {
        let version = parse_api_version("1.43").unwrap();
        assert_eq!(version.major_version, 1);
        assert_eq!(version.minor_version, 43);

        assert!(parse_api_version("latest").is_err());
        assert!(parse_api_version("1").is_err());
    }
}
