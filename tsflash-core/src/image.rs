//! The source image: opened once, mapped read-only, shared by every job.
//!
//! Compressed images (`.gz`, `.xz`, `.zst`) are inflated into a temporary
//! file first so that the mapping always covers the raw disk image. The
//! temporary file is deleted when the [`SourceImage`] is dropped.
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::cancel::CancelToken;

/// Errors raised while opening or mapping an image.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image file does not exist: {0}")]
    NotFound(PathBuf),
    #[error("image path is not a file: {0}")]
    NotAFile(PathBuf),
    #[error("image file is empty: {0}")]
    Empty(PathBuf),
    #[error("image {path} is {len} bytes, more than this system can map")]
    TooLarge { path: PathBuf, len: u64 },
    #[error("decompression of {0} was cancelled")]
    Cancelled(PathBuf),
    #[error("cannot read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// True when the file name says the image needs inflating before use.
pub fn is_compressed(path: &Path) -> bool {
    Compression::from_path(path) != Compression::None
}

/// A read-only memory mapping of a raw disk image.
///
/// The mapping is never written through. It is `Send + Sync` so that many
/// flash workers can read it concurrently without locking; the kernel pages
/// the file in once and every job shares those pages.
pub struct SourceImage {
    path: PathBuf,
    ptr: *const u8,
    len: usize,
    _file: File,
    _temp: Option<TempPath>,
}

// SAFETY: the mapping is PROT_READ and lives until drop; shared reads are fine.
unsafe impl Send for SourceImage {}
unsafe impl Sync for SourceImage {}

impl std::fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceImage")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl SourceImage {
    /// Opens and maps an image, inflating it first if it is compressed.
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        Self::open_with_progress(path, &CancelToken::new(), |_| {})
    }

    /// Like [`SourceImage::open`], reporting inflated bytes while a
    /// compressed image is being unpacked.
    pub fn open_with_progress<F>(
        path: &Path,
        cancel: &CancelToken,
        on_decompress_progress: F,
    ) -> Result<Self, ImageError>
    where
        F: FnMut(u64),
    {
        if !path.exists() {
            return Err(ImageError::NotFound(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(ImageError::NotAFile(path.to_path_buf()));
        }
        let io_err = |source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        };

        let temp = match decompress_image(path, cancel, on_decompress_progress) {
            Ok(temp) => temp,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Err(ImageError::Cancelled(path.to_path_buf()));
            }
            Err(e) => return Err(io_err(e)),
        };
        let raw_path: &Path = temp.as_deref().unwrap_or(path);

        let file = File::open(raw_path).map_err(io_err)?;
        let len = mappable_len(path, file.metadata().map_err(io_err)?.len())?;
        if len == 0 {
            return Err(ImageError::Empty(path.to_path_buf()));
        }

        let ptr = map_readonly(&file, len).map_err(io_err)?;
        log::debug!("Mapped {} ({} bytes)", raw_path.display(), len);

        Ok(Self {
            path: path.to_path_buf(),
            ptr,
            len,
            _file: file,
            _temp: temp,
        })
    }

    /// The path the image was opened from (the compressed file, if any).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the raw image in bytes.
    pub fn len(&self) -> u64 {
        self.len as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The bytes of `[offset, offset + len)`, clamped to the image end.
    pub fn chunk(&self, offset: u64, len: usize) -> &[u8] {
        let bytes = self.as_bytes();
        let start = usize::try_from(offset).map_or(bytes.len(), |o| o.min(bytes.len()));
        let end = start.saturating_add(len).min(bytes.len());
        &bytes[start..end]
    }
}

impl Drop for SourceImage {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap in `open`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// The file length as a mapping size; lengths past the address space
/// (images over 4 GiB on 32-bit systems) are refused rather than truncated.
fn mappable_len(path: &Path, len: u64) -> Result<usize, ImageError> {
    usize::try_from(len).map_err(|_| ImageError::TooLarge {
        path: path.to_path_buf(),
        len,
    })
}

fn map_readonly(file: &File, len: usize) -> io::Result<*const u8> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: a fresh private read-only mapping of an open file.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *const u8)
}

/// Inflates a compressed image into a temporary file.
///
/// Returns `None` for raw images, which are mapped in place.
fn decompress_image<F>(
    input_path: &Path,
    cancel: &CancelToken,
    mut on_progress: F,
) -> io::Result<Option<TempPath>>
where
    F: FnMut(u64),
{
    let compression = Compression::from_path(input_path);
    if compression == Compression::None {
        return Ok(None);
    }

    let input_file = BufReader::new(File::open(input_path)?);
    let mut reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(input_file)),
        Compression::Xz => Box::new(XzDecoder::new(input_file)),
        Compression::Zstd => Box::new(ZstdDecoder::new(input_file)?),
        Compression::None => unreachable!("raw images return early"),
    };

    log::info!("Decompressing {}", input_path.display());
    let mut temp_file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; 64 * 1024];
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "decompression cancelled",
                ));
            }

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    Ok(Some(temp_file.into_temp_path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    #[test]
    fn maps_raw_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("os.img");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let image = SourceImage::open(&path).unwrap();
        assert_eq!(image.len(), data.len() as u64);
        assert_eq!(image.as_bytes(), &data[..]);
        assert_eq!(image.chunk(9_990, 100), &data[9_990..]);
        assert!(image.chunk(20_000, 10).is_empty());
    }

    #[test]
    fn chunk_offsets_past_the_end_are_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("os.img");
        std::fs::write(&path, [1u8; 512]).unwrap();

        let image = SourceImage::open(&path).unwrap();
        assert!(image.chunk(u64::MAX, 16).is_empty());
        assert!(image.chunk(1 << 33, 16).is_empty());
        assert_eq!(image.chunk(500, 16).len(), 12);
    }

    #[test]
    fn lengths_beyond_the_address_space_are_refused() {
        let path = Path::new("big.img");
        assert_eq!(mappable_len(path, 4096).unwrap(), 4096);
        let five_gib = 5u64 << 30;
        match mappable_len(path, five_gib) {
            Ok(len) => {
                assert!(usize::BITS > 32);
                assert_eq!(len as u64, five_gib);
            }
            Err(ImageError::TooLarge { len, .. }) => {
                assert_eq!(usize::BITS, 32);
                assert_eq!(len, five_gib);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
        if usize::BITS < 64 {
            assert!(matches!(
                mappable_len(path, u64::MAX),
                Err(ImageError::TooLarge { .. })
            ));
        }
    }

    #[test]
    fn inflates_gzip_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("os.img.gz");
        let data = vec![0x5au8; 70_000];
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), GzLevel::fast());
        enc.write_all(&data).unwrap();
        enc.finish().unwrap();

        let mut seen = 0;
        let image = SourceImage::open_with_progress(&path, &CancelToken::new(), |n| seen = n)
            .unwrap();
        assert_eq!(image.len(), 70_000);
        assert_eq!(seen, 70_000);
        assert!(image.as_bytes().iter().all(|&b| b == 0x5a));
        assert_eq!(image.path(), path.as_path());
    }

    #[test]
    fn rejects_missing_empty_and_directories() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SourceImage::open(&dir.path().join("nope.img")),
            Err(ImageError::NotFound(_))
        ));
        assert!(matches!(
            SourceImage::open(dir.path()),
            Err(ImageError::NotAFile(_))
        ));
        let empty = dir.path().join("empty.img");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            SourceImage::open(&empty),
            Err(ImageError::Empty(_))
        ));
    }

    #[test]
    fn cancelled_decompression_reports_cancelled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("os.img.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), GzLevel::fast());
        enc.write_all(&[1u8; 1024]).unwrap();
        enc.finish().unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            SourceImage::open_with_progress(&path, &cancel, |_| {}),
            Err(ImageError::Cancelled(_))
        ));
    }
}
