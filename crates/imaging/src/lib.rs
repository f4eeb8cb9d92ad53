use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub mod sparse;
pub mod transfer;

pub use sparse::{SparseDecoder, SparseHeader, SPARSE_HEADER_MAGIC};
pub use transfer::{TransferBuffer, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Sparse,
    Gzip,
    Zip,
    Raw,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Sparse => "sparse",
            ImageFormat::Gzip => "gzip",
            ImageFormat::Zip => "zip",
            ImageFormat::Raw => "raw",
        }
    }
}

/// Identifies an image by its leading magic bytes. Anything unrecognised is raw.
pub fn detect_format(header: &[u8]) -> ImageFormat {
    if header.len() >= 4 && header[..4] == SPARSE_HEADER_MAGIC.to_le_bytes() {
        ImageFormat::Sparse
    } else if header.starts_with(b"\x1f\x8b") {
        ImageFormat::Gzip
    } else if header.starts_with(b"PK\x03\x04") {
        ImageFormat::Zip
    } else {
        ImageFormat::Raw
    }
}

pub fn detect_file_format(path: impl AsRef<Path>) -> Result<ImageFormat> {
    let path = path.as_ref();
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let read = file.read(&mut header[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(detect_format(&header[..filled]))
}

/// Running SHA-256 over the bytes handed to a partition.
#[derive(Default)]
pub struct ImageDigest {
    hasher: Sha256,
}

impl ImageDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize_hex(self) -> String {
        to_hex(&self.hasher.finalize())
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageInspection {
    pub source: String,
    pub format: ImageFormat,
    pub file_size: u64,
    pub unsparsed_size: Option<u64>,
    pub expanded_size: u64,
    pub expanded_sha256: String,
}

#[derive(Debug, Clone, Copy)]
pub struct InspectProgress {
    pub bytes_expanded: u64,
    pub total_bytes: u64,
}

pub trait ProgressObserver {
    /// Returning `false` stops the inspection.
    fn on_progress(&mut self, progress: InspectProgress) -> bool;
}

/// Reads an image through the sparse decoder and digests the flat content.
pub fn inspect_image(
    path: impl AsRef<Path>,
    chunk_size: usize,
    mut observer: Option<&mut dyn ProgressObserver>,
) -> Result<ImageInspection> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    let path = path.as_ref();
    let format = detect_file_format(path)?;
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let file_size = file.metadata()?.len();
    let mut decoder = SparseDecoder::new(BufReader::new(file))
        .with_context(|| format!("read sparse header of {}", path.display()))?;
    let unsparsed_size = decoder.unsparsed_size();
    let total_bytes = unsparsed_size.unwrap_or(file_size);

    let mut buffer = vec![0u8; chunk_size];
    let mut digest = ImageDigest::new();
    let mut expanded = 0u64;
    loop {
        let read = decoder.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
        expanded += read as u64;
        if let Some(obs) = observer.as_deref_mut() {
            let progress = InspectProgress {
                bytes_expanded: expanded,
                total_bytes,
            };
            if !obs.on_progress(progress) {
                return Err(anyhow!("inspection cancelled"));
            }
        }
    }

    Ok(ImageInspection {
        source: path.display().to_string(),
        format,
        file_size,
        unsparsed_size,
        expanded_size: expanded,
        expanded_sha256: digest.finalize_hex(),
    })
}
