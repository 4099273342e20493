use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;

use crate::error::Result;

/// Raw bytes of a model file, either mapped or read into memory.
#[derive(Debug)]
pub enum ModelImage {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl Deref for ModelImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ModelImage::Mapped(m) => m,
            ModelImage::Owned(v) => v,
        }
    }
}

impl ModelImage {
    pub fn is_mapped(&self) -> bool {
        matches!(self, ModelImage::Mapped(_))
    }
}

/// Open a model file. `use_mmap` maps it read-only; otherwise the whole file is
/// read into a heap buffer. `prefault` asks the kernel to populate every page
/// up front, which is how `use_mlock` is honoured on this backend.
pub fn open_model(path: &Path, use_mmap: bool, prefault: bool) -> Result<ModelImage> {
    let mut file = File::open(path)?;
    if !use_mmap {
        let mut buf = Vec::with_capacity(file.metadata()?.len() as usize);
        file.read_to_end(&mut buf)?;
        tracing::debug!("model read into memory ({}MB)", buf.len() / (1024 * 1024));
        return Ok(ModelImage::Owned(buf));
    }

    if prefault {
        match try_mmap_populate(&file) {
            Ok(m) => {
                tracing::debug!("mmap: pre-faulted ({}MB)", m.len() / (1024 * 1024));
                return Ok(ModelImage::Mapped(m));
            }
            Err(e) => tracing::warn!("pre-faulted mmap failed, using lazy pages: {e}"),
        }
    }

    // SAFETY: read-only mapping of a file we keep open for the mapping's lifetime.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    tracing::debug!("mmap: standard pages ({}MB)", mmap.len() / (1024 * 1024));
    Ok(ModelImage::Mapped(mmap))
}

fn try_mmap_populate(file: &File) -> std::io::Result<memmap2::Mmap> {
    // SAFETY: as above.
    unsafe { memmap2::MmapOptions::new().populate().map(file) }
}
