//! Weight archive formats.
//!
//! Both formats store the same Keras layout: an ordered list of layer
//! names, and for every layer an ordered list of named weight arrays.
//!
//! ## HDF5 (feature `hdf5`)
//! ```text
//! /                      attr layer_names  = [b"block1_conv1", ...]
//! /block1_conv1          attr weight_names = [b"block1_conv1/kernel:0", ...]
//! /block1_conv1/block1_conv1/kernel:0   dataset (3, 3, 3, 64) f32
//! ```
//!
//! ## `SafeTensors`
//! ```text
//! [8-byte header: u64 metadata length (little-endian)]
//! [JSON metadata: tensor entries + __metadata__ {layer_names, weight_names/<layer>}]
//! [Raw tensor data: F32 values in little-endian]
//! ```
//!
//! [`open_archive`] picks the reader from the file's magic bytes, so a
//! cached `*.h5` name may hold either format.

#[cfg(feature = "hdf5")]
mod hdf5;
pub mod safetensors;

use crate::error::{FcnError, Result};
use std::io::Read;
use std::path::Path;

pub use safetensors::{save_weight_archive, SafeTensorsArchive};

/// HDF5 superblock signature.
pub const HDF5_MAGIC: [u8; 8] = *b"\x89HDF\r\n\x1a\n";

/// One stored weight array.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWeight {
    /// Weight name as recorded in the archive, e.g. `block1_conv1/kernel:0`
    pub name: String,
    /// Array shape
    pub shape: Vec<usize>,
    /// Row-major values
    pub data: Vec<f32>,
}

impl StoredWeight {
    /// Creates a stored weight, checking that `data` fills `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`] when the element count differs.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(FcnError::shape(
                format!("stored weight `{name}`"),
                expected,
                data.len(),
            ));
        }
        Ok(Self { name, shape, data })
    }
}

/// Read access to a weight archive.
pub trait WeightArchive {
    /// Layer names in archive order.
    fn layer_names(&self) -> &[String];

    /// Weights of one layer in stored order (empty for weightless layers).
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is unknown or its data is corrupt.
    fn layer_weights(&self, layer: &str) -> Result<Vec<StoredWeight>>;
}

/// Opens a weight archive, choosing the reader from the file signature.
///
/// # Errors
///
/// Returns [`FcnError::MissingCapability`] for HDF5 files when the `hdf5`
/// feature is disabled, or an I/O / format error.
pub fn open_archive(path: &Path) -> Result<Box<dyn WeightArchive>> {
    let mut magic = [0u8; 8];
    let mut file = std::fs::File::open(path).map_err(|e| FcnError::io(path, e))?;
    let read = file.read(&mut magic).map_err(|e| FcnError::io(path, e))?;

    if read == magic.len() && magic == HDF5_MAGIC {
        open_hdf5(path)
    } else {
        Ok(Box::new(SafeTensorsArchive::open(path)?))
    }
}

#[cfg(feature = "hdf5")]
fn open_hdf5(path: &Path) -> Result<Box<dyn WeightArchive>> {
    Ok(Box::new(self::hdf5::Hdf5Archive::open(path)?))
}

#[cfg(not(feature = "hdf5"))]
fn open_hdf5(_path: &Path) -> Result<Box<dyn WeightArchive>> {
    Err(FcnError::MissingCapability {
        operation: "load_weights",
        feature: "hdf5",
    })
}

/// Writes a Keras-layout HDF5 archive.
///
/// # Errors
///
/// Returns an error if the file cannot be written, or
/// [`FcnError::MissingCapability`] without the `hdf5` feature.
#[cfg(feature = "hdf5")]
pub fn save_hdf5_archive(path: &Path, layers: &[(String, Vec<StoredWeight>)]) -> Result<()> {
    self::hdf5::save(path, layers)
}

/// Writes a Keras-layout HDF5 archive.
///
/// # Errors
///
/// Always returns [`FcnError::MissingCapability`]; enable the `hdf5` feature.
#[cfg(not(feature = "hdf5"))]
pub fn save_hdf5_archive(_path: &Path, _layers: &[(String, Vec<StoredWeight>)]) -> Result<()> {
    Err(FcnError::MissingCapability {
        operation: "save_weights",
        feature: "hdf5",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stored_weight_checks_length() {
        assert!(StoredWeight::new("w", vec![2, 2], vec![0.0; 4]).is_ok());
        assert!(matches!(
            StoredWeight::new("w", vec![2, 2], vec![0.0; 3]),
            Err(FcnError::ShapeMismatch { .. })
        ));
    }

    #[cfg(not(feature = "hdf5"))]
    #[test]
    fn test_hdf5_signature_without_feature() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("weights.h5");
        let mut bytes = HDF5_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        std::fs::write(&path, bytes).expect("write");

        let err = open_archive(&path).err().expect("hdf5 needs the feature");
        assert!(matches!(
            err,
            FcnError::MissingCapability {
                feature: "hdf5",
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_file_is_archive_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("weights.h5");
        std::fs::write(&path, b"definitely not weights").expect("write");

        assert!(matches!(open_archive(&path), Err(FcnError::Archive { .. })));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = open_archive(Path::new("/no/such/weights.h5")).err().expect("missing");
        assert!(matches!(err, FcnError::Io { .. }));
    }
}
