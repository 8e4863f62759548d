//! Memory regions shared between the driver and the application

use std::fs::File;
use std::io;
use std::ops::Range;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

/// Owned mapping of one capture buffer, unmapped on drop.
///
/// A region may carry a lease: a token the mapping's owner hands out so it
/// can tell how many of its regions are still mapped.
pub struct MappedRegion {
    map: MmapMut,
    _lease: Option<Arc<()>>,
}

impl MappedRegion {
    /// Map `len` bytes of `file` at the driver-assigned `offset`
    pub fn map(file: &File, offset: u64, len: usize) -> io::Result<Self> {
        // SAFETY: the region is shared with the driver, which writes it only
        // while the buffer is queued; the pool never hands out a slice of a
        // queued buffer
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file)? };
        Ok(Self { map, _lease: None })
    }

    /// Same as [`MappedRegion::map`], holding `lease` until the region drops
    pub fn leased(file: &File, offset: u64, len: usize, lease: Arc<()>) -> io::Result<Self> {
        let mut region = Self::map(file, offset, len)?;
        region._lease = Some(lease);
        Ok(region)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Address range covered by the mapping
    pub fn address_range(&self) -> Range<usize> {
        let start = self.map.as_ptr() as usize;
        start..start + self.map.len()
    }

    /// The first `len` bytes, clamped to the mapping
    pub(crate) fn bytes(&self, len: usize) -> &[u8] {
        &self.map[..len.min(self.map.len())]
    }
}
