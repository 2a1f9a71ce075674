//! File-backed image sources

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use k230boot_core::{ImageError, ImageSet, ImageSource};

/// A firmware image loaded from disk
#[derive(Debug, Clone)]
pub struct FileImage {
    data: Vec<u8>,
}

impl FileImage {
    /// Read an image file
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
        })?;
        log::debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Ok(Self { data })
    }

    /// Image contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl ImageSource for FileImage {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ImageError> {
        self.data.as_slice().read(offset, length)
    }
}

/// Images keyed by the name a boot plan uses for them
#[derive(Debug, Default)]
pub struct FileImages {
    images: BTreeMap<String, FileImage>,
}

impl FileImages {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` under `name`, once
    pub fn load(&mut self, name: &str, path: &Path) -> io::Result<()> {
        if !self.images.contains_key(name) {
            self.images.insert(name.to_string(), FileImage::open(path)?);
        }
        Ok(())
    }
}

impl ImageSet for FileImages {
    fn source(&self, name: &str) -> Option<&dyn ImageSource> {
        self.images.get(name).map(|i| i as &dyn ImageSource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_image() {
        let path = std::env::temp_dir().join(format!("k230boot-image-{}.bin", std::process::id()));
        fs::write(&path, [1u8, 2, 3, 4, 5]).unwrap();

        let mut images = FileImages::new();
        images.load("fw", &path).unwrap();
        let image = images.source("fw").unwrap();
        assert_eq!(image.len(), 5);
        assert_eq!(image.read(1, 3).unwrap(), vec![2, 3, 4]);
        assert!(image.read(4, 2).is_err());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = FileImage::open("/nonexistent/k230boot/fw.bin").unwrap_err();
        assert!(err.to_string().contains("fw.bin"));
    }
}
