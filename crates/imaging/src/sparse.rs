//! Android sparse image decoding.
//!
//! A sparse image is a 28 byte file header followed by chunks. Each chunk
//! covers a run of output blocks and is either copied verbatim (raw), expanded
//! from a 4 byte pattern (fill), expanded to zeros (don't care), or carries a
//! checksum that produces no output (crc32).

use std::io::{self, Read};

pub const SPARSE_HEADER_MAGIC: u32 = 0xed26_ff3a;

const SPARSE_HEADER_LEN: usize = 28;
const CHUNK_HEADER_LEN: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xcac1;
const CHUNK_TYPE_FILL: u16 = 0xcac2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_header_size: u16,
    pub chunk_header_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    pub fn parse(bytes: &[u8; SPARSE_HEADER_LEN]) -> io::Result<Self> {
        if le_u32(bytes, 0) != SPARSE_HEADER_MAGIC {
            return Err(invalid("missing sparse image magic"));
        }
        let header = Self {
            major_version: le_u16(bytes, 4),
            minor_version: le_u16(bytes, 6),
            file_header_size: le_u16(bytes, 8),
            chunk_header_size: le_u16(bytes, 10),
            block_size: le_u32(bytes, 12),
            total_blocks: le_u32(bytes, 16),
            total_chunks: le_u32(bytes, 20),
            image_checksum: le_u32(bytes, 24),
        };
        if header.major_version != 1 {
            return Err(invalid(format!(
                "unsupported sparse major version {}",
                header.major_version
            )));
        }
        if (header.file_header_size as usize) < SPARSE_HEADER_LEN {
            return Err(invalid("sparse file header too small"));
        }
        if (header.chunk_header_size as usize) < CHUNK_HEADER_LEN {
            return Err(invalid("sparse chunk header too small"));
        }
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(invalid(format!(
                "invalid sparse block size {}",
                header.block_size
            )));
        }
        Ok(header)
    }

    pub fn unsparsed_size(&self) -> u64 {
        self.block_size as u64 * self.total_blocks as u64
    }
}

#[derive(Debug, Clone, Copy)]
enum Chunk {
    Raw { remaining: u64 },
    Fill { pattern: [u8; 4], remaining: u64, emitted: u64 },
    DontCare { remaining: u64 },
}

/// Reader that yields the flat image behind a possibly sparse stream.
///
/// Streams without the sparse magic are replayed unchanged, including the
/// bytes consumed while sniffing the header.
pub struct SparseDecoder<R> {
    inner: R,
    header: Option<SparseHeader>,
    prefix: Vec<u8>,
    prefix_pos: usize,
    chunks_left: u32,
    chunk: Option<Chunk>,
    produced: u64,
}

impl<R: Read> SparseDecoder<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut head = [0u8; SPARSE_HEADER_LEN];
        let filled = read_up_to(&mut inner, &mut head)?;
        let has_magic = filled >= 4 && le_u32(&head, 0) == SPARSE_HEADER_MAGIC;
        if !has_magic {
            return Ok(Self {
                inner,
                header: None,
                prefix: head[..filled].to_vec(),
                prefix_pos: 0,
                chunks_left: 0,
                chunk: None,
                produced: 0,
            });
        }
        if filled < SPARSE_HEADER_LEN {
            return Err(truncated("sparse header"));
        }

        let header = SparseHeader::parse(&head)?;
        skip(
            &mut inner,
            header.file_header_size as u64 - SPARSE_HEADER_LEN as u64,
        )?;
        tracing::debug!(
            block_size = header.block_size,
            total_blocks = header.total_blocks,
            total_chunks = header.total_chunks,
            "sparse image detected"
        );
        Ok(Self {
            inner,
            header: Some(header),
            prefix: Vec::new(),
            prefix_pos: 0,
            chunks_left: header.total_chunks,
            chunk: None,
            produced: 0,
        })
    }

    /// Wraps a stream without sniffing; bytes pass through untouched.
    pub fn passthrough(inner: R) -> Self {
        Self {
            inner,
            header: None,
            prefix: Vec::new(),
            prefix_pos: 0,
            chunks_left: 0,
            chunk: None,
            produced: 0,
        }
    }

    /// Logical size of the expanded image, `None` when the stream is not sparse.
    pub fn unsparsed_size(&self) -> Option<u64> {
        self.header.map(|header| header.unsparsed_size())
    }

    pub fn header(&self) -> Option<&SparseHeader> {
        self.header.as_ref()
    }

    pub fn is_sparse(&self) -> bool {
        self.header.is_some()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_passthrough(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.prefix_pos < self.prefix.len() {
            let pending = &self.prefix[self.prefix_pos..];
            let count = pending.len().min(buf.len());
            buf[..count].copy_from_slice(&pending[..count]);
            self.prefix_pos += count;
            return Ok(count);
        }
        self.inner.read(buf)
    }

    fn read_sparse(&mut self, header: SparseHeader, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Some(chunk) = self.chunk else {
                if self.chunks_left == 0 {
                    if self.produced != header.unsparsed_size() {
                        return Err(invalid(format!(
                            "sparse chunks cover {} bytes, header declares {}",
                            self.produced,
                            header.unsparsed_size()
                        )));
                    }
                    return Ok(0);
                }
                self.chunk = self.next_chunk(&header)?;
                continue;
            };

            let (count, next) = match chunk {
                Chunk::Raw { remaining } => {
                    let want = remaining.min(buf.len() as u64) as usize;
                    let count = self.inner.read(&mut buf[..want])?;
                    if count == 0 {
                        return Err(truncated("raw chunk"));
                    }
                    (count, Chunk::Raw { remaining: remaining - count as u64 })
                }
                Chunk::Fill {
                    pattern,
                    remaining,
                    emitted,
                } => {
                    let count = remaining.min(buf.len() as u64) as usize;
                    for (index, byte) in buf[..count].iter_mut().enumerate() {
                        *byte = pattern[((emitted + index as u64) % 4) as usize];
                    }
                    (
                        count,
                        Chunk::Fill {
                            pattern,
                            remaining: remaining - count as u64,
                            emitted: emitted + count as u64,
                        },
                    )
                }
                Chunk::DontCare { remaining } => {
                    let count = remaining.min(buf.len() as u64) as usize;
                    buf[..count].fill(0);
                    (count, Chunk::DontCare { remaining: remaining - count as u64 })
                }
            };

            self.produced += count as u64;
            self.chunk = if chunk_remaining(&next) == 0 {
                None
            } else {
                Some(next)
            };
            return Ok(count);
        }
    }

    fn next_chunk(&mut self, header: &SparseHeader) -> io::Result<Option<Chunk>> {
        let mut raw = [0u8; CHUNK_HEADER_LEN];
        self.inner
            .read_exact(&mut raw)
            .map_err(|_| truncated("chunk header"))?;
        skip(
            &mut self.inner,
            header.chunk_header_size as u64 - CHUNK_HEADER_LEN as u64,
        )?;
        self.chunks_left -= 1;

        let chunk_type = le_u16(&raw, 0);
        let chunk_blocks = le_u32(&raw, 4) as u64;
        let total_size = le_u32(&raw, 8) as u64;
        let body = total_size
            .checked_sub(header.chunk_header_size as u64)
            .ok_or_else(|| invalid("sparse chunk smaller than its header"))?;
        let output = chunk_blocks * header.block_size as u64;

        if self.produced + output > header.unsparsed_size() {
            return Err(invalid("sparse chunks exceed the declared image size"));
        }

        let chunk = match chunk_type {
            CHUNK_TYPE_RAW => {
                if body != output {
                    return Err(invalid(format!(
                        "raw chunk carries {} bytes for {} output bytes",
                        body, output
                    )));
                }
                Chunk::Raw { remaining: output }
            }
            CHUNK_TYPE_FILL => {
                if body != 4 {
                    return Err(invalid("fill chunk must carry a 4 byte pattern"));
                }
                let mut pattern = [0u8; 4];
                self.inner
                    .read_exact(&mut pattern)
                    .map_err(|_| truncated("fill pattern"))?;
                Chunk::Fill {
                    pattern,
                    remaining: output,
                    emitted: 0,
                }
            }
            CHUNK_TYPE_DONT_CARE => {
                if body != 0 {
                    return Err(invalid("don't care chunk must not carry data"));
                }
                Chunk::DontCare { remaining: output }
            }
            CHUNK_TYPE_CRC32 => {
                if body != 4 {
                    return Err(invalid("crc32 chunk must carry 4 bytes"));
                }
                skip(&mut self.inner, 4)?;
                return Ok(None);
            }
            other => {
                return Err(invalid(format!("unknown sparse chunk type {:#06x}", other)));
            }
        };

        if output == 0 {
            return Ok(None);
        }
        Ok(Some(chunk))
    }
}

impl<R: Read> Read for SparseDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.header {
            Some(header) => self.read_sparse(header, buf),
            None => self.read_passthrough(buf),
        }
    }
}

fn chunk_remaining(chunk: &Chunk) -> u64 {
    match chunk {
        Chunk::Raw { remaining } => *remaining,
        Chunk::Fill { remaining, .. } => *remaining,
        Chunk::DontCare { remaining } => *remaining,
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn skip<R: Read>(reader: &mut R, count: u64) -> io::Result<()> {
    if count == 0 {
        return Ok(());
    }
    let skipped = io::copy(&mut reader.take(count), &mut io::sink())?;
    if skipped != count {
        return Err(truncated("sparse padding"));
    }
    Ok(())
}

fn le_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("sparse image truncated in {}", what),
    )
}
