use std::ffi::CStr;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::mem::align_of;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;
use std::slice;

use crate::Result;


/// Retrieve the inode number of the file at `path`, following symbolic
/// links.
pub fn stat_ino<P>(path: P) -> io::Result<u64>
where
    P: AsRef<Path>,
{
    fs::metadata(path).map(|meta| meta.ino())
}


#[inline]
pub(crate) fn bytes_to_os_str(bytes: &[u8]) -> Result<&OsStr> {
    Ok(OsStr::from_bytes(bytes))
}


/// Render a byte slice as lower case hexadecimal string.
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut hex, byte| {
            let () = hex.push(char::from(b"0123456789abcdef"[usize::from(byte >> 4)]));
            let () = hex.push(char::from(b"0123456789abcdef"[usize::from(byte & 0xf)]));
            hex
        },
    )
}


/// See `find_match_or_lower_bound`, but allow the user to pass in a
/// function extracting the key to compare.
pub(crate) fn find_match_or_lower_bound_by_key<T, U, F>(
    slice: &[T],
    item: U,
    mut f: F,
) -> Option<usize>
where
    U: Ord,
    F: FnMut(&T) -> U,
{
    let idx = slice.partition_point(|e| f(e) < item);

    // At this point `idx` references the first item greater or equal to the one
    // we are looking for.

    if let Some(e) = slice.get(idx) {
        // If the item at `idx` is equal to what we were looking for, we are
        // trivially done, as it's guaranteed to be the first one to match.
        if f(e) == item {
            return Some(idx)
        }
    }

    // Otherwise `idx` points to a "greater" item. Hence, we pick the previous
    // one, but then have to scan backwards for as long as we see this one item,
    // so that we end up reporting the index of the first of all equal ones.
    let idx = idx.checked_sub(1)?;
    let cmp_e = f(slice.get(idx)?);

    for i in (0..idx).rev() {
        let e = slice.get(i)?;
        if f(e) != cmp_e {
            return Some(i + 1)
        }
    }
    Some(idx)
}

/// Perform a binary search on a slice, returning the index of the match (if
/// found) or the one of the previous item (if any), taking into account
/// duplicates.
#[cfg(test)]
fn find_match_or_lower_bound<T>(slice: &[T], item: T) -> Option<usize>
where
    T: Copy + Ord,
{
    find_match_or_lower_bound_by_key(slice, item, |e| *e)
}


/// A marker trait for "plain old data" data types.
///
/// # Safety
/// Only safe to implement for types that are valid for any bit pattern.
pub(crate) unsafe trait Pod {}

unsafe impl Pod for u32 {}


/// A cursor over raw ELF data, consuming what it reads.
pub(crate) trait ReadRaw<'data> {
    /// Consume and return `len` bytes.
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]>;

    /// Read a NUL terminated string.
    fn read_cstr(&mut self) -> Option<&'data CStr>;

    /// Consume `len` bytes without returning them.
    #[inline]
    fn advance(&mut self, len: usize) -> Option<()> {
        let _data = self.read_slice(len)?;
        Some(())
    }

    /// Read a copy of a `Pod`, irrespective of alignment.
    #[inline]
    fn read_pod<T>(&mut self) -> Option<T>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>())?;
        // SAFETY: `T` is `Pod` and `data` spans `size_of::<T>()`
        //         readable bytes.
        let value = unsafe { data.as_ptr().cast::<T>().read_unaligned() };
        Some(value)
    }

    /// Read a reference to a `Pod`, failing if the data is misaligned
    /// for `T`.
    #[inline]
    fn read_pod_ref<T>(&mut self) -> Option<&'data T>
    where
        T: Pod,
    {
        let [value] = self.read_pod_slice_ref::<T>(1)? else {
            return None
        };
        Some(value)
    }

    /// Read a reference to `count` consecutive `Pod`s, failing if the
    /// data is misaligned for `T`.
    #[inline]
    fn read_pod_slice_ref<T>(&mut self, count: usize) -> Option<&'data [T]>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>().checked_mul(count)?)?;
        let ptr = data.as_ptr();
        if ptr.align_offset(align_of::<T>()) != 0 {
            return None
        }

        // SAFETY: `T` is `Pod`, `ptr` is aligned for `T`, and it points
        //         to `count * size_of::<T>()` readable bytes living for
        //         `'data`.
        let slice = unsafe { slice::from_raw_parts(ptr.cast::<T>(), count) };
        Some(slice)
    }

    /// Read a native endian `u32`, as used by `.gnu_debuglink`.
    #[inline]
    fn read_u32(&mut self) -> Option<u32> {
        self.read_pod::<u32>()
    }
}

impl<'data> ReadRaw<'data> for &'data [u8] {
    #[inline]
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]> {
        if len > self.len() {
            return None
        }
        let (data, rest) = self.split_at(len);
        *self = rest;
        Some(data)
    }

    #[inline]
    fn read_cstr(&mut self) -> Option<&'data CStr> {
        let idx = self.iter().position(|byte| *byte == b'\0')?;
        CStr::from_bytes_with_nul(self.read_slice(idx + 1)?).ok()
    }
}
