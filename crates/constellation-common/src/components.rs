//! Kubernetes component lists stored in `k8s-components-*` ConfigMaps
//!
//! The ConfigMap referenced by `NodeVersion.spec.kubernetesComponentsReference`
//! holds a JSON array under [`COMPONENTS_KEY`].

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// ConfigMap data key holding the JSON component list
pub const COMPONENTS_KEY: &str = "components";

/// Prefix of ConfigMaps holding component lists
pub const COMPONENTS_CONFIGMAP_PREFIX: &str = "k8s-components-";

/// A downloadable binary or archive installed on nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Component {
    /// Download location
    pub url: String,
    /// Expected hash of the download (`sha256:<hex>`)
    pub hash: String,
    /// Target path on the node
    #[serde(default)]
    pub install_path: String,
    /// Whether the download is an archive to extract
    #[serde(default)]
    pub extract: bool,
}

/// Ordered list of components making up a Kubernetes version
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Components(pub Vec<Component>);

impl Components {
    /// Parse the JSON stored in a components ConfigMap
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::serialization(format!("parsing components list: {e}")))
    }

    /// The kubeadm binary, identified by its download URL
    pub fn kubeadm(&self) -> Result<&Component> {
        self.0
            .iter()
            .find(|c| c.url.contains("kubeadm"))
            .ok_or_else(|| Error::not_found("component", "kubeadm"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"[
        {"url":"https://storage.googleapis.com/k8s/v1.29.0/crictl.tar.gz","hash":"sha256:aa","install_path":"/run/state/bin","extract":true},
        {"url":"https://storage.googleapis.com/k8s/v1.29.0/bin/linux/amd64/kubeadm","hash":"sha256:bb","install_path":"/run/state/bin/kubeadm"}
    ]"#;

    #[test]
    fn finds_kubeadm() {
        let components = Components::parse(LIST).unwrap();
        assert_eq!(components.0.len(), 2);
        let kubeadm = components.kubeadm().unwrap();
        assert_eq!(kubeadm.hash, "sha256:bb");
        assert!(!kubeadm.extract);
    }

    #[test]
    fn missing_kubeadm_is_not_found() {
        let components = Components::parse("[]").unwrap();
        assert!(components.kubeadm().unwrap_err().is_not_found());
        assert!(Components::parse("{}").is_err());
    }
}
