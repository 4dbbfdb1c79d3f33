//! Control-plane taint collection and taint set differences.
//!
//! The agent must tolerate whatever taints the control-plane nodes carry, so the desired
//! taint set is derived from the nodes themselves. Taints are compared structurally on
//! their (key, value, effect) triple; `timeAdded` is not part of a taint's identity.

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;
use tracing::{debug, trace};

/// Role labels that mark a node as part of the control plane when set to `true`
const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/controlplane",
    "node-role.kubernetes.io/control-plane",
];

// Taints managed by the kubelet and node lifecycle controller, never relevant to the agent
const RESERVED_TAINT_PREFIXES: &[&str] = &["node.kubernetes.io"];

/// Result of comparing an observed taint set with a desired one
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaintDiff {
    /// Present in desired, missing from current
    pub to_add: Vec<Taint>,
    /// Present in current, missing from desired
    pub to_remove: Vec<Taint>,
}

impl TaintDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

pub fn same_taint(a: &Taint, b: &Taint) -> bool {
    a.key == b.key && a.value == b.value && a.effect == b.effect
}

fn contains_taint(taints: &[Taint], taint: &Taint) -> bool {
    taints.iter().any(|t| same_taint(t, taint))
}

/// Set difference between `current` and `desired`. Order of either input is irrelevant.
pub fn diff_taints(current: &[Taint], desired: &[Taint]) -> TaintDiff {
    TaintDiff {
        to_add: desired
            .iter()
            .filter(|t| !contains_taint(current, t))
            .cloned()
            .collect(),
        to_remove: current
            .iter()
            .filter(|t| !contains_taint(desired, t))
            .cloned()
            .collect(),
    }
}

fn is_reserved(taint: &Taint) -> bool {
    RESERVED_TAINT_PREFIXES
        .iter()
        .any(|prefix| taint.key.starts_with(prefix))
}

pub fn is_control_plane(node: &Node) -> bool {
    let labels = node.labels();
    CONTROL_PLANE_LABELS
        .iter()
        .any(|key| labels.get(*key).is_some_and(|value| value == "true"))
}

/// Accumulate the distinct, non-reserved taints of every control-plane node, in node order.
pub fn control_plane_taints(nodes: &[Node]) -> Vec<Taint> {
    let mut all_taints: Vec<Taint> = Vec::new();

    for node in nodes.iter().filter(|n| is_control_plane(n)) {
        let node_taints = node
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.as_deref())
            .unwrap_or_default();

        for taint in diff_taints(&all_taints, node_taints).to_add {
            if is_reserved(&taint) {
                trace!(
                    "Skipping taint '{}' on node '{}', reserved for the kubelet",
                    taint.key,
                    node.name_any()
                );
                continue;
            }
            // a node may list the same taint twice
            if !contains_taint(&all_taints, &taint) {
                all_taints.push(taint);
            }
        }
    }

    debug!("Collected {} control plane taints", all_taints.len());
    all_taints
}
