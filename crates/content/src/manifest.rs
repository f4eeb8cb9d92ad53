use crate::local_image_size;
use anyhow::{anyhow, Context, Result};
use dsu_core::{
    ByteSource, InstallationRequest, PartitionSource, SourceKind, REQUEST_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestImage {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// On-disk description of an installation request. Relative paths resolve
/// against the manifest's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestManifest {
    pub schema_version: String,
    pub kind: SourceKind,
    pub userdata_size_bytes: u64,
    #[serde(default)]
    pub images: Vec<ManifestImage>,
    #[serde(default)]
    pub package: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
}

pub fn load_request_manifest(path: impl AsRef<Path>) -> Result<RequestManifest> {
    let path = path.as_ref();
    let data =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);
    let manifest: RequestManifest = if is_yaml {
        serde_yaml::from_str(&data).with_context(|| format!("parse {}", path.display()))?
    } else {
        serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?
    };
    if manifest.schema_version != REQUEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported request schema {} (expected {})",
            manifest.schema_version,
            REQUEST_SCHEMA_VERSION
        ));
    }
    Ok(manifest)
}

impl RequestManifest {
    pub fn into_request(self, base_dir: impl AsRef<Path>) -> Result<InstallationRequest> {
        let base = base_dir.as_ref();
        if self.userdata_size_bytes == 0 {
            return Err(anyhow!("userdata_size_bytes must be > 0"));
        }
        match self.kind {
            SourceKind::SingleImage => {
                let [image] = self.images.as_slice() else {
                    return Err(anyhow!("single_image requests need exactly one image"));
                };
                let (path, size) = resolve_image(base, image)?;
                Ok(InstallationRequest::single_image(
                    size,
                    ByteSource::File(path),
                    self.userdata_size_bytes,
                ))
            }
            SourceKind::MultiImage => {
                if self.images.is_empty() {
                    return Err(anyhow!("multi_image requests need at least one image"));
                }
                let entries = self
                    .images
                    .iter()
                    .map(|image| {
                        let (path, size) = resolve_image(base, image)?;
                        Ok(PartitionSource::new(&image.name, size, ByteSource::File(path)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(InstallationRequest::multi_image(entries, self.userdata_size_bytes))
            }
            SourceKind::Package => {
                let package = self
                    .package
                    .ok_or_else(|| anyhow!("package requests need a package path"))?;
                let path = base.join(package);
                let name = path.display().to_string();
                Ok(InstallationRequest::package(
                    name,
                    ByteSource::File(path),
                    self.userdata_size_bytes,
                ))
            }
            SourceKind::RemotePackage => {
                let url = self
                    .url
                    .ok_or_else(|| anyhow!("remote_package requests need a url"))?;
                Ok(InstallationRequest::remote_package(url, self.userdata_size_bytes))
            }
        }
    }
}

fn resolve_image(base: &Path, image: &ManifestImage) -> Result<(PathBuf, u64)> {
    let path = base.join(&image.path);
    let size = match image.size_bytes {
        Some(size) => size,
        None => local_image_size(&path).with_context(|| format!("size of {}", image.name))?,
    };
    Ok((path, size))
}
