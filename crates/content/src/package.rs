//! Sequential reading of GSI package archives.
//!
//! Packages are consumed front to back from their local headers so that a
//! remote archive never has to be buffered or seeked.

use crate::ContentError;
use std::cell::Cell;
use std::io::{self, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

pub struct PackageImage<'a> {
    pub partition: String,
    pub entry_name: String,
    pub size: u64,
    pub reader: &'a mut dyn Read,
}

/// Maps an archive entry to the partition it installs.
///
/// Only `*.img` entries count; the partition is the file stem. macOS resource
/// forks (`._foo.img`) are ignored.
pub fn partition_name_for_entry(entry_name: &str) -> Option<String> {
    let base = entry_name.rsplit('/').next()?;
    if base.starts_with("._") || base.len() <= 4 {
        return None;
    }
    let (stem, ext) = base.split_at(base.len() - 4);
    if !ext.eq_ignore_ascii_case(".img") {
        return None;
    }
    Some(stem.to_string())
}

/// Walks every image entry in order, handing each to `visit`.
///
/// Entries that are not images, and whatever part of an image `visit` leaves
/// unread, are drained so the stream stays aligned. Once `visit` returns
/// `Visit::Stop` or an error, nothing more is read from `reader`. Returns the
/// number of images visited.
pub fn stream_package_images<R, E, F>(reader: &mut R, mut visit: F) -> Result<usize, E>
where
    R: Read,
    E: From<ContentError>,
    F: FnMut(PackageImage<'_>) -> Result<Visit, E>,
{
    let stopped = Cell::new(false);
    let mut gate = StopGate {
        inner: reader,
        stopped: &stopped,
    };
    let mut visited = 0;
    loop {
        let next = zip::read::read_zipfile_from_stream(&mut gate).map_err(ContentError::from)?;
        let Some(mut entry) = next else {
            break;
        };
        let entry_name = entry.name().to_string();
        let partition = if entry.is_dir() {
            None
        } else {
            partition_name_for_entry(&entry_name)
        };

        let Some(partition) = partition else {
            tracing::debug!(entry = %entry_name, "skipping non-image package entry");
            io::copy(&mut entry, &mut io::sink()).map_err(ContentError::from)?;
            continue;
        };

        visited += 1;
        let size = entry.size();
        let decision = visit(PackageImage {
            partition,
            entry_name,
            size,
            reader: &mut entry,
        });
        match decision {
            Ok(Visit::Continue) => {
                io::copy(&mut entry, &mut io::sink()).map_err(ContentError::from)?;
            }
            Ok(Visit::Stop) => {
                // Dropping a streamed entry drains it; the gate turns that into a no-op.
                stopped.set(true);
                break;
            }
            Err(err) => {
                stopped.set(true);
                return Err(err);
            }
        }
    }
    Ok(visited)
}

/// Reports end of input once `stopped` is set.
struct StopGate<'a, R> {
    inner: &'a mut R,
    stopped: &'a Cell<bool>,
}

impl<R: Read> Read for StopGate<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stopped.get() {
            return Ok(0);
        }
        self.inner.read(buf)
    }
}
