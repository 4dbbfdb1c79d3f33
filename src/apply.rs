//! Pushing the agent manifest to a remote cluster and removing obsolete companions.
//!
//! Right after a cluster comes up the agent namespace often lacks the privileges the manifest
//! needs, so the first apply attempts are expected to fail. They are retried with a fixed delay
//! and only escalated once the attempt budget is spent.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, trace, warn};

use crate::{
    remote::{CommandFailure, Companion, DeleteOutcome, RemoteCluster},
    Error, Result, APPLY_ATTEMPTS_TOTAL,
};

pub const DEFAULT_APPLY_ATTEMPTS: u32 = 5;
pub const DEFAULT_APPLY_DELAY: Duration = Duration::from_secs(5);
const REDACTED: &str = "REDACTED";

lazy_static! {
    static ref TOKEN_PATTERN: Regex = Regex::new(r#""token":"[^"]*""#).unwrap();
}

/// Bounded retry with a fixed delay between attempts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_APPLY_ATTEMPTS,
            delay: DEFAULT_APPLY_DELAY,
        }
    }
}

/// Make command output safe to show in errors and conditions: newlines are collapsed and
/// embedded `"token":"..."` values are replaced.
pub fn redact_output(output: &str) -> String {
    let compact = output.replace('\n', " ");
    TOKEN_PATTERN
        .replace_all(&compact, format!(r#""token":"{REDACTED}""#).as_str())
        .into_owned()
}

fn command_error(context: &str, failure: CommandFailure) -> Error {
    Error::Command {
        context: context.to_string(),
        error: redact_output(&failure.error),
        output: redact_output(&failure.output),
    }
}

/// Apply `manifest`, retrying up to `policy.max_attempts` times. Returns the output of the
/// successful attempt, or the last failure.
pub async fn apply_with_retry(
    remote: &dyn RemoteCluster,
    cluster: &str,
    token: &str,
    manifest: &[u8],
    policy: &RetryPolicy,
) -> Result<String, CommandFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        trace!(
            "Applying agent manifest to cluster '{}', try #{}",
            cluster,
            attempt
        );
        match remote.apply_manifest(cluster, token, manifest).await {
            Ok(output) => {
                APPLY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                debug!(
                    "Applied agent manifest to cluster '{}' on try #{}",
                    cluster, attempt
                );
                return Ok(output);
            }
            Err(failure) => {
                APPLY_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
                if attempt >= max_attempts {
                    warn!(
                        "Applying agent manifest to cluster '{}' failed after {} tries: {}",
                        cluster,
                        attempt,
                        redact_output(&failure.error)
                    );
                    return Err(failure);
                }
                debug!(
                    "Applying agent manifest to cluster '{}' failed on try #{}, retrying in {}s",
                    cluster,
                    attempt,
                    policy.delay.as_secs()
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Apply the agent manifest, turning exhaustion into a composite error carrying the redacted
/// command output.
pub async fn apply_agent(
    remote: &dyn RemoteCluster,
    cluster: &str,
    token: &str,
    manifest: &[u8],
    policy: &RetryPolicy,
) -> Result<String> {
    apply_with_retry(remote, cluster, token, manifest, policy)
        .await
        .map_err(|failure| {
            command_error(
                "Error while applying agent manifest, it will be retried automatically",
                failure,
            )
        })
}

/// Delete obsolete companion workloads. A companion that is already gone counts as removed.
pub async fn remove_companions(
    remote: &dyn RemoteCluster,
    cluster: &str,
    token: &str,
    companions: &[Companion],
) -> Result<()> {
    for companion in companions {
        match remote.delete_companion(cluster, token, *companion).await {
            Ok(DeleteOutcome::Deleted(output)) => {
                debug!(
                    "Removed {} from cluster '{}': {}",
                    companion,
                    cluster,
                    redact_output(&output)
                );
            }
            Ok(DeleteOutcome::NotFound(_)) => {
                debug!("{} not present in cluster '{}'", companion, cluster);
            }
            Err(failure) => {
                trace!(
                    "Deleting {} from cluster '{}' failed: {}, output: {}",
                    companion,
                    cluster,
                    failure.error,
                    redact_output(&failure.output)
                );
                return Err(command_error(
                    &format!("deleting {companion} failed"),
                    failure,
                ));
            }
        }
    }
    Ok(())
}
