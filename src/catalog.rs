//! Browser catalog: the static mapping from `(browserName, version)` to
//! a pod template, loaded from a YAML or JSON file and hot-reloaded when
//! the file changes on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1 as corev1;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Config files larger than this are refused outright.
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),
    #[error("config file exceeds {MAX_CONFIG_BYTES} bytes")]
    TooLarge,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty config")]
    Empty,
    #[error("unknown browser name {0}")]
    UnknownBrowser(String),
    #[error("unknown browser version {0}")]
    UnknownVersion(String),
}

/// Labels and annotations attached to every pod built from a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Pod-level knobs a template may set, in Kubernetes terms.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<corev1::ResourceRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_aliases: Option<Vec<corev1::HostAlias>>,
    #[serde(rename = "env", skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<Vec<corev1::EnvVar>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<corev1::Affinity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<corev1::PodDNSConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<corev1::Toleration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<corev1::VolumeMount>>,
}

/// Pod security identity for the browser container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunAsOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
}

/// A concrete browser image selection. Immutable once loaded; `find`
/// hands out clones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserTemplate {
    #[serde(skip)]
    pub browser_name: String,
    #[serde(skip)]
    pub browser_version: String,
    pub image: String,
    pub path: String,
    pub privileged: bool,
    pub meta: Meta,
    pub spec: ContainerSpec,
    pub run_as: RunAsOptions,
    /// Kernel capabilities added to the browser container.
    #[serde(rename = "capabilities", skip_serializing_if = "Option::is_none")]
    pub kernel_caps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<corev1::Volume>>,
}

/// One browser family in the config file: shared defaults plus
/// per-version overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Layout {
    #[serde(rename = "spec")]
    pub default_spec: ContainerSpec,
    pub meta: Meta,
    pub path: String,
    pub default_version: String,
    pub versions: BTreeMap<String, BrowserTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<corev1::Volume>>,
}

/// Hot-reloadable browser catalog.
pub struct Catalog {
    config_file: PathBuf,
    containers: RwLock<BTreeMap<String, Layout>>,
}

impl Catalog {
    pub fn load(config_file: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let config_file = config_file.into();
        let containers = read_config(&config_file)?;
        Ok(Self {
            config_file,
            containers: RwLock::new(containers),
        })
    }

    /// Re-read the config file and swap the map atomically. On failure
    /// the previous catalog stays in place.
    pub fn reload(&self) -> Result<(), CatalogError> {
        let containers = read_config(&self.config_file)?;
        *self.containers.write() = containers;
        Ok(())
    }

    /// Look up a template. An unknown version falls back to the
    /// family's `defaultVersion` when one is configured.
    pub fn find(&self, name: &str, version: &str) -> Result<BrowserTemplate, CatalogError> {
        let containers = self.containers.read();
        let layout = containers
            .get(name)
            .ok_or_else(|| CatalogError::UnknownBrowser(name.to_string()))?;

        let (resolved, template) = match layout.versions.get(version) {
            Some(t) => (version, t),
            None => {
                if layout.default_version.is_empty() {
                    return Err(CatalogError::UnknownVersion(version.to_string()));
                }
                match layout.versions.get(&layout.default_version) {
                    Some(t) => (layout.default_version.as_str(), t),
                    None => return Err(CatalogError::UnknownVersion(version.to_string())),
                }
            }
        };

        let mut template = template.clone();
        template.browser_name = name.to_string();
        template.browser_version = resolved.to_string();
        Ok(template)
    }

    /// Known versions per browser family, numerically sorted.
    pub fn versions(&self) -> BTreeMap<String, Vec<String>> {
        let containers = self.containers.read();
        containers
            .iter()
            .map(|(name, layout)| {
                let mut versions: Vec<String> = layout.versions.keys().cloned().collect();
                versions.sort_by(|a, b| {
                    numeric_prefix(a)
                        .partial_cmp(&numeric_prefix(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.cmp(b))
                });
                (name.clone(), versions)
            })
            .collect()
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }
}

/// Leading numeric portion of a version string, for sorting.
fn numeric_prefix(version: &str) -> f64 {
    let numeric: String = version
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    // Tolerate strings like "68.0.1": keep digits up to the second dot.
    let mut dots = 0;
    let trimmed: String = numeric
        .chars()
        .take_while(|c| {
            if *c == '.' {
                dots += 1;
            }
            dots < 2
        })
        .collect();
    trimmed.parse().unwrap_or(0.0)
}

fn read_config(config_file: &Path) -> Result<BTreeMap<String, Layout>, CatalogError> {
    let meta = std::fs::metadata(config_file)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(CatalogError::TooLarge);
    }

    let content = std::fs::read_to_string(config_file)?;

    // The file may be YAML or JSON; YAML is a superset but its error
    // messages are poor for JSON bodies, so try JSON first.
    let mut layouts: BTreeMap<String, Layout> = match serde_json::from_str(&content) {
        Ok(layouts) => layouts,
        Err(_) => serde_yaml::from_str(&content).map_err(|e| CatalogError::Parse(e.to_string()))?,
    };

    if layouts.is_empty() {
        return Err(CatalogError::Empty);
    }

    for layout in layouts.values_mut() {
        let default_spec = layout.default_spec.clone();
        let meta = layout.meta.clone();
        let volumes = layout.volumes.clone();
        for template in layout.versions.values_mut() {
            if template.path.is_empty() {
                template.path = layout.path.clone();
            }
            merge_meta(&mut template.meta, &meta);
            merge_spec(&mut template.spec, &default_spec);
            if template.volumes.is_none() {
                template.volumes = volumes.clone();
            }
        }
    }

    Ok(layouts)
}

/// Union of version-level and family-level metadata; the family level
/// wins on conflicts.
fn merge_meta(template: &mut Meta, family: &Meta) {
    for (k, v) in &family.labels {
        template.labels.insert(k.clone(), v.clone());
    }
    for (k, v) in &family.annotations {
        template.annotations.insert(k.clone(), v.clone());
    }
}

/// Fill spec fields the version entry left unset from the family
/// defaults. Node selectors are unioned with the version winning.
fn merge_spec(template: &mut ContainerSpec, family: &ContainerSpec) {
    if template.resources.is_none() {
        template.resources = family.resources.clone();
    }
    if template.host_aliases.is_none() {
        template.host_aliases = family.host_aliases.clone();
    }
    if template.env_vars.is_none() {
        template.env_vars = family.env_vars.clone();
    }
    if template.affinity.is_none() {
        template.affinity = family.affinity.clone();
    }
    if template.dns_config.is_none() {
        template.dns_config = family.dns_config.clone();
    }
    if template.tolerations.is_none() {
        template.tolerations = family.tolerations.clone();
    }
    if template.volume_mounts.is_none() {
        template.volume_mounts = family.volume_mounts.clone();
    }
    match (&mut template.node_selector, &family.node_selector) {
        (Some(version), Some(family)) => {
            for (k, v) in family {
                version.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        (selector @ None, Some(family)) => *selector = Some(family.clone()),
        _ => {}
    }
}

/// Watch the catalog's config file and reload on change.
///
/// Kubernetes mounts ConfigMaps through a flipped symlink rather than an
/// in-place write, so the parent directory is watched and any event in
/// it triggers a debounced reload. Reload failures are logged and the
/// previous catalog stays live.
pub async fn watch_config(catalog: Arc<Catalog>) {
    use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher = match notify::recommended_watcher(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => tracing::warn!(?err, "config watcher error"),
        },
    ) {
        Ok(w) => w,
        Err(err) => {
            tracing::error!(?err, "failed to initialize config watcher");
            return;
        }
    };

    let dir = catalog
        .config_file()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        tracing::error!(?err, dir = %dir.display(), "failed to watch config directory");
        return;
    }

    tracing::info!(file = %catalog.config_file().display(), "watching browsers config");

    while let Some(event) = rx.recv().await {
        use notify::EventKind;
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
            _ => continue,
        }

        // Let the write (or the ConfigMap symlink flip) settle, then
        // drain whatever else arrived in the meantime.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while rx.try_recv().is_ok() {}

        match catalog.reload() {
            Ok(()) => tracing::info!("browsers config reloaded"),
            Err(err) => tracing::error!(%err, "browsers config reload failed"),
        }
    }
}
