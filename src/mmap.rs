use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap as Mapping;
use memmap2::MmapOptions;

use crate::Error;
use crate::ErrorExt as _;
use crate::Result;


/// A read-only memory mapping of a file, in its entirety.
#[derive(Debug)]
pub(crate) struct Mmap {
    /// The actual memory mapping. `None` for empty files, which the
    /// kernel refuses to map.
    mapping: Option<Mapping>,
}

impl Mmap {
    /// Map the provided file into memory.
    pub(crate) fn map(file: &File) -> Result<Self> {
        let len = libc::size_t::try_from(file.metadata()?.len())
            .map_err(Error::with_invalid_data)
            .context("file is too large to mmap")?;

        let mapping = if len == 0 {
            None
        } else {
            // SAFETY: The mapping is read-only. We have no control over
            //         other processes truncating the file, which is a
            //         risk shared by every mmap based reader.
            Some(unsafe { MmapOptions::new().len(len).map(file) }?)
        };
        Ok(Self { mapping })
    }

    /// Memory map the file at the provided `path`.
    pub(crate) fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
        Self::map(&file)
    }
}

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.mapping.as_deref().unwrap_or(&[])
    }
}
