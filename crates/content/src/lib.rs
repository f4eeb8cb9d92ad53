use dsu_core::{ByteSource, GsiInfo};
use dsu_imaging::{detect_format, ImageFormat, SparseDecoder};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod manifest;
pub mod package;

pub use manifest::{load_request_manifest, ManifestImage, RequestManifest};
pub use package::{partition_name_for_entry, stream_package_images, PackageImage, Visit};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("download {url}: {source}")]
    Http { url: String, source: reqwest::Error },
    #[error("read package: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Opens a byte source for sequential reading.
///
/// Local files with a gzip header are decompressed on the fly; URLs are
/// streamed, never buffered whole.
pub fn open_byte_source(source: ByteSource) -> Result<Box<dyn Read + Send>, ContentError> {
    match source {
        ByteSource::File(path) => open_local_image(&path),
        ByteSource::Url(url) => open_remote(&url),
        ByteSource::Reader(reader) => Ok(reader),
    }
}

fn open_local_image(path: &Path) -> Result<Box<dyn Read + Send>, ContentError> {
    let (file, format) = open_sniffed(path)?;
    if format == ImageFormat::Gzip {
        tracing::debug!(path = %path.display(), "decompressing gzip image");
        return Ok(Box::new(GzDecoder::new(BufReader::new(file))));
    }
    Ok(Box::new(BufReader::new(file)))
}

fn open_remote(url: &str) -> Result<Box<dyn Read + Send>, ContentError> {
    let http = |source| ContentError::Http {
        url: url.to_string(),
        source,
    };
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None::<Duration>)
        .build()
        .map_err(http)?;
    let response = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(http)?;
    tracing::info!(url, length = ?response.content_length(), "streaming remote package");
    Ok(Box::new(response))
}

fn open_sniffed(path: &Path) -> Result<(File, ImageFormat), ContentError> {
    let open_err = |source| ContentError::Open {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(open_err)?;
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let read = file.read(&mut magic[filled..]).map_err(open_err)?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    file.seek(SeekFrom::Start(0)).map_err(open_err)?;
    Ok((file, detect_format(&magic[..filled])))
}

/// Size a local image occupies once installed.
///
/// Plain and sparse files report their on-disk length. Gzip images report
/// the sparse header's logical size, or the decompressed length when the
/// payload is not sparse.
pub fn local_image_size(path: impl AsRef<Path>) -> Result<u64, ContentError> {
    let path = path.as_ref();
    let (file, format) = open_sniffed(path)?;
    if format != ImageFormat::Gzip {
        return Ok(file.metadata()?.len());
    }
    let mut decoder = SparseDecoder::new(GzDecoder::new(BufReader::new(file)))?;
    if let Some(size) = decoder.unsparsed_size() {
        return Ok(size);
    }
    tracing::debug!(path = %path.display(), "counting decompressed image size");
    Ok(io::copy(&mut decoder, &mut io::sink())?)
}

/// Architecture hint from a GSI file name such as `system-arm64-ab.img`.
pub fn guess_architecture(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    let arch = if lower.contains("arm64") || lower.contains("aarch64") {
        "arm64"
    } else if lower.contains("x86_64") || lower.contains("x86-64") {
        "x86_64"
    } else if lower.contains("x86") {
        "x86"
    } else if lower.contains("a64") || lower.contains("arm") {
        "arm"
    } else {
        return None;
    };
    Some(arch.to_string())
}

pub fn describe_gsi(path: impl AsRef<Path>) -> Result<GsiInfo, ContentError> {
    let path = path.as_ref();
    let (file, format) = open_sniffed(path)?;
    let size_bytes = file.metadata()?.len();
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    Ok(GsiInfo {
        architecture: guess_architecture(&name),
        name,
        size_bytes,
        format: format.as_str().to_string(),
    })
}

/// Remote packages are only known by their URL until streamed.
pub fn describe_remote_gsi(url: &str) -> GsiInfo {
    let name = url
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string();
    GsiInfo {
        architecture: guess_architecture(&name),
        name,
        size_bytes: 0,
        format: ImageFormat::Zip.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_gzip(path: &Path, payload: &[u8]) {
        let file = File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::fast());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn gzip_images_are_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.img.gz");
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
        write_gzip(&path, &payload);

        let mut reader = open_byte_source(ByteSource::File(path.clone())).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(local_image_size(&path).unwrap(), 50_000);
    }

    #[test]
    fn plain_images_report_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("product.img");
        std::fs::write(&path, vec![0u8; 12_345]).unwrap();
        assert_eq!(local_image_size(&path).unwrap(), 12_345);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = open_byte_source(ByteSource::File(PathBuf::from("/nonexistent/system.img")))
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/system.img"));
    }

    #[test]
    fn guesses_architecture_from_name() {
        assert_eq!(guess_architecture("system-arm64-ab.img").as_deref(), Some("arm64"));
        assert_eq!(guess_architecture("lineage-a64-bvN.img").as_deref(), Some("arm"));
        assert_eq!(guess_architecture("gsi_x86_64.zip").as_deref(), Some("x86_64"));
        assert_eq!(guess_architecture("gsi_x86.zip").as_deref(), Some("x86"));
        assert_eq!(guess_architecture("system.img"), None);
    }

    #[test]
    fn describes_local_and_remote_gsi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system-arm64.img");
        std::fs::write(&path, vec![1u8; 64]).unwrap();
        let info = describe_gsi(&path).unwrap();
        assert_eq!(info.name, "system-arm64.img");
        assert_eq!(info.size_bytes, 64);
        assert_eq!(info.format, "raw");

        let remote = describe_remote_gsi("https://example.invalid/builds/gsi_x86_64.zip");
        assert_eq!(remote.name, "gsi_x86_64.zip");
        assert_eq!(remote.architecture.as_deref(), Some("x86_64"));
    }
}
