use std::io::{self, Read};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer buffer {0} still holds bytes the service has not consumed")]
    Busy(u64),
    #[error("requested {requested} bytes but only {staged} are staged")]
    Overrun { requested: usize, staged: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shared buffer between the producer (installer) and the privileged service.
///
/// Ownership alternates strictly: the producer fills it, hands a byte count to
/// the service, and the service drains it before the next fill.
#[derive(Debug)]
pub struct TransferBuffer {
    id: u64,
    data: Vec<u8>,
    staged: Option<usize>,
}

impl TransferBuffer {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity],
            staged: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes filled but not yet drained by the consumer.
    pub fn is_pending(&self) -> bool {
        self.staged.is_some()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.unwrap_or(0)
    }

    /// Reads until the buffer is full or the reader is exhausted.
    /// Returns 0 at end of input.
    pub fn fill(&mut self, reader: &mut dyn Read) -> Result<usize, TransferError> {
        if self.staged.is_some() {
            return Err(TransferError::Busy(self.id));
        }
        let mut filled = 0;
        while filled < self.data.len() {
            match reader.read(&mut self.data[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransferError::Io(err)),
            }
        }
        if filled > 0 {
            self.staged = Some(filled);
        }
        Ok(filled)
    }

    /// Staged bytes, for the producer to digest before submitting.
    pub fn staged(&self) -> &[u8] {
        &self.data[..self.staged_len()]
    }

    /// Consumer side: takes `byte_count` staged bytes and releases the buffer.
    pub fn drain(&mut self, byte_count: usize) -> Result<&[u8], TransferError> {
        let staged = self.staged_len();
        if byte_count > staged {
            return Err(TransferError::Overrun {
                requested: byte_count,
                staged,
            });
        }
        self.staged = None;
        Ok(&self.data[..byte_count])
    }
}
