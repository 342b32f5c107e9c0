//! Thin wrapper over the chunked LAZ compressor: one COPC octant in, one
//! LAZ chunk out, with the chunk's absolute offset and byte size reported
//! back for the hierarchy.

use std::io::{Seek, Write};

use laz::{LasZipCompressor, LazVlr};

use crate::Result;

/// Size of one chunk as recorded in the hierarchy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkEntry {
    pub point_count: u64,
    pub byte_count: u64,
}

pub(crate) struct CopcCompressor<'a, W: Write + Seek + Send + Sync + 'a> {
    compressor: LasZipCompressor<'a, W>,
    point_size: usize,
}

impl<'a, W: Write + Seek + Send + Sync + 'a> CopcCompressor<'a, W> {
    pub fn new(write: W, vlr: LazVlr) -> Result<Self> {
        let point_size = vlr.items_size() as usize;
        let mut compressor = LasZipCompressor::new(write, vlr)?;
        // Write the chunk-table offset placeholder now so the position of
        // the first chunk is known before compressing it.
        compressor.reserve_offset_to_chunk_table()?;
        Ok(Self { compressor, point_size })
    }

    /// Compress one octant's records as a single chunk. Returns the entry
    /// and the absolute file offset of the chunk start.
    pub fn compress_chunk(&mut self, points: &[u8]) -> Result<(ChunkEntry, u64)> {
        let start = self.compressor.get_mut().stream_position()?;
        self.compressor.compress_many(points)?;
        self.compressor.finish_current_chunk()?;
        let end = self.compressor.get_mut().stream_position()?;

        Ok((
            ChunkEntry {
                point_count: (points.len() / self.point_size) as u64,
                byte_count: end - start,
            },
            start,
        ))
    }

    /// Write the chunk table and release the stream.
    pub fn done(mut self) -> Result<W> {
        self.compressor.done()?;
        Ok(self.compressor.into_inner())
    }
}
