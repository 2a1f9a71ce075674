//! Image sources
//!
//! The core never opens files. Callers hand the sequencer an [`ImageSet`]
//! that resolves image names to [`ImageSource`]s; in-memory implementations
//! are provided for byte buffers and maps.

use std::collections::BTreeMap;

use crate::error::ImageError;

/// A readable firmware image
///
/// Reads must be deterministic: the same range always yields the same bytes.
pub trait ImageSource {
    /// Total image size in bytes
    fn len(&self) -> u64;

    /// Whether the image is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `length` bytes starting at `offset`
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ImageError>;
}

/// Named collection of images
pub trait ImageSet {
    /// Look up an image by name
    fn source(&self, name: &str) -> Option<&dyn ImageSource>;
}

fn read_slice(data: &[u8], offset: u64, length: u64) -> Result<Vec<u8>, ImageError> {
    let size = data.len() as u64;
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(data[offset as usize..end as usize].to_vec()),
        _ => Err(ImageError::OutOfRange {
            offset,
            length,
            size,
        }),
    }
}

impl ImageSource for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ImageError> {
        read_slice(self, offset, length)
    }
}

impl ImageSource for Vec<u8> {
    fn len(&self) -> u64 {
        Vec::len(self) as u64
    }

    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ImageError> {
        read_slice(self, offset, length)
    }
}

impl ImageSource for &[u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ImageError> {
        read_slice(self, offset, length)
    }
}

impl<S: ImageSource> ImageSet for BTreeMap<String, S> {
    fn source(&self, name: &str) -> Option<&dyn ImageSource> {
        self.get(name).map(|s| s as &dyn ImageSource)
    }
}

impl<S: ImageSource> ImageSet for BTreeMap<&str, S> {
    fn source(&self, name: &str) -> Option<&dyn ImageSource> {
        self.get(name).map(|s| s as &dyn ImageSource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_in_range() {
        let image = vec![0u8, 1, 2, 3, 4, 5, 6, 7];
        assert_eq!(image.read(2, 3).unwrap(), vec![2, 3, 4]);
        assert_eq!(image.read(8, 0).unwrap(), Vec::<u8>::new());
        assert_eq!(ImageSource::len(&image), 8);
    }

    #[test]
    fn test_read_out_of_range() {
        let image: &[u8] = &[0u8; 16];
        assert!(matches!(
            image.read(10, 7),
            Err(ImageError::OutOfRange {
                offset: 10,
                length: 7,
                size: 16
            })
        ));
        assert!(image.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_image_set_lookup() {
        let mut images = BTreeMap::new();
        images.insert("spl".to_string(), vec![0xAAu8; 32]);
        assert_eq!(images.source("spl").map(|s| s.len()), Some(32));
        assert!(images.source("uboot").is_none());
    }
}
