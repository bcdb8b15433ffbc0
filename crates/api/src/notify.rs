//! Chat-webhook notifier for reconciliation outcomes.
//!
//! Builds a Slack block-kit payload distinguishing successful, partially
//! successful, and failed deployments, with one provenance block per
//! updated container. Nothing is sent when there is nothing to report.

use std::time::Duration;

use berth_core::diff::Delta;
use berth_core::model::UpdatedContainer;
use berth_core::Error;
use serde_json::{json, Value};

/// HTTP request timeout for a webhook delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Report the outcome of a reconciliation to a chat webhook.
///
/// Delivery failures are logged and swallowed: the notifier is advisory and
/// must never fail a sync.
pub async fn report_sync(webhook_url: &str, delta: Option<&Delta>, errs: &[Error]) {
    let updated = delta.map(|d| d.updated_containers.as_slice()).unwrap_or(&[]);
    if errs.is_empty() && updated.is_empty() {
        tracing::debug!("Nothing to report.");
        return;
    }

    let payload = build_payload(updated, errs);
    if let Err(err) = send_payload(webhook_url, &payload).await {
        tracing::warn!(error = %err, "Unable to deliver webhook notification.");
    }
}

/// Assemble the block-kit payload for one outcome.
fn build_payload(updated: &[UpdatedContainer], errs: &[Error]) -> Value {
    let mut blocks: Vec<Value> = Vec::with_capacity(updated.len() + errs.len() + 3);

    let headline = match (updated.is_empty(), errs.is_empty()) {
        (false, false) => ":warning: *Partially successful deployment.*",
        (false, true) => ":recycle: *Successful deployment.*",
        _ => ":rotating_light: *Failed deployment.*",
    };
    blocks.push(markdown_block(headline));

    if !errs.is_empty() {
        blocks.push(divider());
        for err in errs {
            blocks.push(markdown_block(&format!(":exclamation: Error: {err}")));
        }
    }

    if !updated.is_empty() {
        blocks.push(divider());
        for container in updated {
            blocks.push(markdown_block(&container_line(container)));
        }
    }

    json!({
        "text": headline.replace(['*', ':'], "").trim(),
        "blocks": blocks,
    })
}

/// One status line for an updated container, linking provenance when the
/// image carried it.
fn container_line(container: &UpdatedContainer) -> String {
    let mut line = format!(
        "`{}` now runs *{}:{}*",
        container.unit_name, container.image_name, container.image_tag
    );
    if let (Some(repo_url), Some(repo)) = (container.repository_url(), &container.repository) {
        line.push_str(&format!(" from <{repo_url}|{repo}>"));
    }
    if let (Some(commit_url), Some(commit)) = (container.commit_url(), &container.commit) {
        line.push_str(&format!(" at <{commit_url}|`{commit}`>"));
    }
    if let (Some(branch_url), Some(git_ref)) = (container.branch_url(), &container.git_ref) {
        if git_ref != "main" && git_ref != "master" {
            line.push_str(&format!(" on <{branch_url}|`{git_ref}`>"));
        }
    }
    line
}

fn markdown_block(markdown: &str) -> Value {
    json!({
        "type": "section",
        "text": {
            "type": "mrkdwn",
            "text": markdown,
            "verbatim": true,
        },
    })
}

fn divider() -> Value {
    json!({ "type": "divider" })
}

async fn send_payload(webhook_url: &str, payload: &Value) -> Result<(), reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let response = client.post(webhook_url).json(payload).send().await?;
    tracing::debug!(status = %response.status(), "Webhook response received.");
    response.error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updated() -> UpdatedContainer {
        UpdatedContainer {
            unit_name: "berth-web.service".into(),
            image_name: "quay.io/berth/berth-web".into(),
            image_tag: "v3".into(),
            repository: Some("https://github.com/berth/web".into()),
            commit: Some("0f4c2a1".into()),
            git_ref: Some("main".into()),
        }
    }

    #[test]
    fn successful_deployment_headline() {
        let payload = build_payload(&[updated()], &[]);
        assert_eq!(payload["text"], "recycle Successful deployment.");
        let first = payload["blocks"][0]["text"]["text"].as_str().unwrap();
        assert!(first.contains("Successful deployment"));
    }

    #[test]
    fn partial_deployment_includes_errors_and_containers() {
        let errs = vec![Error::ContainerRuntime("pull timed out".into())];
        let payload = build_payload(&[updated()], &errs);
        let first = payload["blocks"][0]["text"]["text"].as_str().unwrap();
        assert!(first.contains("Partially successful"));

        let rendered = payload.to_string();
        assert!(rendered.contains("pull timed out"));
        assert!(rendered.contains("berth-web.service"));
    }

    #[test]
    fn failed_deployment_lists_only_errors() {
        let errs = vec![Error::InitSystem("reload refused".into())];
        let payload = build_payload(&[], &errs);
        let first = payload["blocks"][0]["text"]["text"].as_str().unwrap();
        assert!(first.contains("Failed deployment"));
        assert!(payload.to_string().contains("reload refused"));
    }

    #[test]
    fn mainline_refs_omit_the_branch_link() {
        let line = container_line(&updated());
        assert!(line.contains("github.com/berth/web"));
        assert!(line.contains("0f4c2a1"));
        assert!(!line.contains("/tree/main"));

        let mut feature = updated();
        feature.git_ref = Some("feature/tls".into());
        assert!(container_line(&feature).contains("/tree/feature/tls"));
    }
}
