//! Helpers for inspecting and patching Kubernetes `Node` objects
//!
//! Donor/heir pairs are represented purely as annotations holding the name
//! of the paired node. Everything here is pure so the reconcilers can unit
//! test classification without an API server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;

/// Annotation on an heir naming the outdated node it replaces
pub const DONOR_ANNOTATION: &str = "constellation.edgeless.systems/donor";
/// Annotation on a donor naming the node replacing it
pub const HEIR_ANNOTATION: &str = "constellation.edgeless.systems/heir";
/// Annotation holding the CSP scaling group the node belongs to
pub const SCALING_GROUP_ANNOTATION: &str = "constellation.edgeless.systems/scaling-group-id";
/// Annotation holding the OS image the node was booted from
pub const NODE_IMAGE_ANNOTATION: &str = "constellation.edgeless.systems/node-image";
/// Annotation marking a node for deletion (`"true"`)
pub const OBSOLETE_ANNOTATION: &str = "constellation.edgeless.systems/obsolete";
/// Annotation holding the Kubernetes components reference the node joined with
pub const COMPONENTS_ANNOTATION: &str = "constellation.edgeless.systems/kubernetes-components";

/// Label set on control-plane nodes by kubeadm
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Label domains reserved for Kubernetes itself; never copied between nodes
const RESERVED_LABEL_DOMAINS: &[&str] = &[
    "kubernetes.io",
    "k8s.io",
    "node.kubernetes.io",
    "node-role.kubernetes.io",
    "topology.kubernetes.io",
    "failure-domain.beta.kubernetes.io",
    "beta.kubernetes.io",
    "app.kubernetes.io",
];

/// Name of a node, empty if unset
pub fn name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

/// Value of an annotation, treating empty strings as unset
pub fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Provider ID of a node (e.g. `gce://project/zone/instance`)
pub fn provider_id(node: &Node) -> Option<&str> {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .filter(|p| !p.is_empty())
}

/// Whether the node reports the `Ready` condition as `True`
pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Whether the node carries the control-plane role label
pub fn is_control_plane(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL))
}

/// First `InternalIP` address of the node
pub fn vpc_ip(node: &Node) -> crate::Result<String> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone())
        .ok_or_else(|| crate::Error::validation_for(name(node), "node has no InternalIP address"))
}

fn is_reserved_label(key: &str) -> bool {
    let Some((domain, _)) = key.split_once('/') else {
        return false;
    };
    RESERVED_LABEL_DOMAINS
        .iter()
        .any(|reserved| domain == *reserved || domain.ends_with(&format!(".{reserved}")))
}

/// Labels of the node that may be carried from a donor to its heir
pub fn filter_labels(labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    labels
        .into_iter()
        .flatten()
        .filter(|(k, _)| !is_reserved_label(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Convert a hostname into an RFC 1123 compliant Kubernetes node name.
///
/// Lowercases and replaces underscores; anything still invalid is rejected.
pub fn k8s_compliant_hostname(input: &str) -> crate::Result<String> {
    let hostname = input.to_lowercase().replace('_', "-");
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if !valid {
        return Err(crate::Error::validation_for(
            input,
            "cannot be converted into an RFC 1123 compliant node name",
        ));
    }
    Ok(hostname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;

    fn node_with(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("gce://p/z/node-1".to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: "node-1".to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "10.9.0.4".to_string(),
                    },
                ]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn reserved_labels_are_not_copied() {
        let node = node_with(
            &[],
            &[
                ("kubernetes.io/hostname", "node-1"),
                ("node.kubernetes.io/instance-type", "n2d"),
                ("node-role.kubernetes.io/control-plane", ""),
                ("topology.kubernetes.io/zone", "a"),
                ("failure-domain.beta.kubernetes.io/region", "r"),
                ("beta.kubernetes.io/arch", "amd64"),
                ("team", "payments"),
                ("example.com/pool", "blue"),
            ],
        );
        let filtered = filter_labels(node.metadata.labels.as_ref());
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered["team"], "payments");
        assert_eq!(filtered["example.com/pool"], "blue");
    }

    #[test]
    fn empty_annotation_counts_as_missing() {
        let node = node_with(&[(NODE_IMAGE_ANNOTATION, ""), (HEIR_ANNOTATION, "n2")], &[]);
        assert_eq!(annotation(&node, NODE_IMAGE_ANNOTATION), None);
        assert_eq!(annotation(&node, HEIR_ANNOTATION), Some("n2"));
        assert_eq!(annotation(&node, DONOR_ANNOTATION), None);
    }

    #[test]
    fn node_accessors() {
        let node = node_with(&[], &[(CONTROL_PLANE_LABEL, "")]);
        assert!(is_ready(&node));
        assert!(is_control_plane(&node));
        assert_eq!(vpc_ip(&node).unwrap(), "10.9.0.4");
        assert_eq!(provider_id(&node), Some("gce://p/z/node-1"));

        let bare = Node::default();
        assert!(!is_ready(&bare));
        assert!(vpc_ip(&bare).is_err());
        assert_eq!(provider_id(&bare), None);
    }

    #[test]
    fn hostnames_are_made_compliant() {
        assert_eq!(k8s_compliant_hostname("Node_1").unwrap(), "node-1");
        assert_eq!(
            k8s_compliant_hostname("worker-0.internal").unwrap(),
            "worker-0.internal"
        );
        assert!(k8s_compliant_hostname("-bad").is_err());
        assert!(k8s_compliant_hostname("").is_err());
        assert!(k8s_compliant_hostname("a b").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn compliant_hostnames_are_stable(input in "[A-Za-z0-9_.-]{1,40}") {
                if let Ok(name) = k8s_compliant_hostname(&input) {
                    prop_assert_eq!(k8s_compliant_hostname(&name).unwrap(), name);
                }
            }

            #[test]
            fn filtered_labels_are_never_reserved(
                custom in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..5),
                zone in "[a-z]{1,5}",
            ) {
                let mut labels = custom.clone();
                labels.insert("topology.kubernetes.io/zone".to_string(), zone);
                labels.insert("kubernetes.io/hostname".to_string(), "node-1".to_string());
                let filtered = filter_labels(Some(&labels));
                prop_assert_eq!(filtered, custom);
            }
        }
    }
}
