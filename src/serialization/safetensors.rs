//! `SafeTensors` weight archives in the Keras layer layout.
//!
//! ```text
//! [8-byte header: u64 metadata length (little-endian)]
//! [JSON metadata: tensor names, dtypes, shapes, data_offsets]
//! [Raw tensor data: F32 values in little-endian]
//! ```
//!
//! Layer structure is kept in `__metadata__` (string values only):
//! `layer_names` holds a JSON array of layer names, and
//! `weight_names/<layer>` a JSON array of that layer's weight names.
//! The tensor for weight `w` of layer `l` is stored under `l/w`.

use super::{StoredWeight, WeightArchive};
use crate::error::{FcnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const LAYER_NAMES_KEY: &str = "layer_names";
const WEIGHT_NAMES_PREFIX: &str = "weight_names/";

/// Metadata for a single tensor in `SafeTensors` format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorMetadata {
    /// Data type of the tensor; only `"F32"` is written or read.
    pub dtype: String,
    /// Shape of the tensor.
    pub shape: Vec<usize>,
    /// Data offsets `[start, end]` in the raw data section.
    pub data_offsets: [usize; 2],
}

/// Tensor entries keyed by name (sorted for deterministic output).
pub type SafeTensorsMetadata = BTreeMap<String, TensorMetadata>;

/// String map stored under `__metadata__`.
pub type UserMetadata = BTreeMap<String, String>;

fn tensor_key(layer: &str, weight: &str) -> String {
    format!("{layer}/{weight}")
}

/// Writes `layers` (in order) to a `SafeTensors` archive.
///
/// Weightless layers are recorded in `layer_names` with an empty weight
/// list, matching what Keras writes for pooling or dropout layers.
///
/// # Errors
///
/// Returns an error if JSON serialization or the file write fails.
pub fn save_weight_archive(path: &Path, layers: &[(String, Vec<StoredWeight>)]) -> Result<()> {
    let mut user_metadata = UserMetadata::new();
    let layer_names: Vec<&str> = layers.iter().map(|(name, _)| name.as_str()).collect();
    user_metadata.insert(
        LAYER_NAMES_KEY.to_string(),
        serde_json::to_string(&layer_names)?,
    );

    let mut tensors: BTreeMap<String, &StoredWeight> = BTreeMap::new();
    for (layer, weights) in layers {
        let names: Vec<&str> = weights.iter().map(|w| w.name.as_str()).collect();
        user_metadata.insert(
            format!("{WEIGHT_NAMES_PREFIX}{layer}"),
            serde_json::to_string(&names)?,
        );
        for weight in weights {
            tensors.insert(tensor_key(layer, &weight.name), weight);
        }
    }

    let mut header = serde_json::Map::new();
    header.insert(
        "__metadata__".to_string(),
        serde_json::to_value(&user_metadata)?,
    );

    let mut raw_data = Vec::new();
    for (name, weight) in &tensors {
        let start_offset = raw_data.len();
        for &value in &weight.data {
            raw_data.extend_from_slice(&value.to_le_bytes());
        }
        let meta = TensorMetadata {
            dtype: "F32".to_string(),
            shape: weight.shape.clone(),
            data_offsets: [start_offset, raw_data.len()],
        };
        header.insert(name.clone(), serde_json::to_value(meta)?);
    }

    let metadata_json = serde_json::to_string(&header)?;
    let metadata_bytes = metadata_json.as_bytes();
    let metadata_len = metadata_bytes.len() as u64;

    let mut output = Vec::with_capacity(8 + metadata_bytes.len() + raw_data.len());
    output.extend_from_slice(&metadata_len.to_le_bytes());
    output.extend_from_slice(metadata_bytes);
    output.extend_from_slice(&raw_data);

    fs::write(path, output).map_err(|e| FcnError::io(path, e))
}

/// A `SafeTensors` archive loaded into memory.
#[derive(Debug)]
pub struct SafeTensorsArchive {
    path: PathBuf,
    metadata: SafeTensorsMetadata,
    layer_names: Vec<String>,
    weight_names: BTreeMap<String, Vec<String>>,
    raw_data: Vec<u8>,
}

impl SafeTensorsArchive {
    /// Reads and validates an archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the header is invalid,
    /// or the layer structure in `__metadata__` is missing.
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| FcnError::io(path, e))?;
        let metadata_len = validate_and_read_header(&bytes).map_err(|m| FcnError::archive(path, m))?;
        let (metadata, user_metadata) =
            parse_metadata(&bytes, metadata_len).map_err(|m| FcnError::archive(path, m))?;

        let layer_names: Vec<String> = user_metadata
            .get(LAYER_NAMES_KEY)
            .ok_or_else(|| FcnError::archive(path, "missing `layer_names` metadata"))
            .and_then(|json| {
                serde_json::from_str(json)
                    .map_err(|e| FcnError::archive(path, format!("bad `layer_names`: {e}")))
            })?;

        let mut weight_names = BTreeMap::new();
        for (key, json) in &user_metadata {
            if let Some(layer) = key.strip_prefix(WEIGHT_NAMES_PREFIX) {
                let names: Vec<String> = serde_json::from_str(json)
                    .map_err(|e| FcnError::archive(path, format!("bad `{key}`: {e}")))?;
                weight_names.insert(layer.to_string(), names);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            layer_names,
            weight_names,
            raw_data: bytes[8 + metadata_len..].to_vec(),
        })
    }

    /// Number of tensors in the archive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// True when the archive holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }
}

impl WeightArchive for SafeTensorsArchive {
    fn layer_names(&self) -> &[String] {
        &self.layer_names
    }

    fn layer_weights(&self, layer: &str) -> Result<Vec<StoredWeight>> {
        let names = self
            .weight_names
            .get(layer)
            .ok_or_else(|| FcnError::archive(&self.path, format!("no group for layer `{layer}`")))?;

        names
            .iter()
            .map(|name| {
                let key = tensor_key(layer, name);
                let meta = self.metadata.get(&key).ok_or_else(|| {
                    FcnError::archive(&self.path, format!("tensor `{key}` not found"))
                })?;
                let data = extract_tensor(&self.raw_data, meta)
                    .map_err(|m| FcnError::archive(&self.path, format!("{key}: {m}")))?;
                StoredWeight::new(name.clone(), meta.shape.clone(), data)
            })
            .collect()
    }
}

fn validate_and_read_header(bytes: &[u8]) -> std::result::Result<usize, String> {
    if bytes.len() < 8 {
        return Err(format!(
            "file is {} bytes, need at least 8 bytes for header",
            bytes.len()
        ));
    }

    let mut header_bytes = [0u8; 8];
    header_bytes.copy_from_slice(&bytes[0..8]);
    let metadata_len = u64::from_le_bytes(header_bytes);

    if metadata_len == 0 {
        return Err("metadata length is 0".to_string());
    }
    if metadata_len > (bytes.len() - 8) as u64 {
        return Err(format!(
            "metadata length {metadata_len} exceeds file size"
        ));
    }

    Ok(metadata_len as usize)
}

fn parse_metadata(
    bytes: &[u8],
    metadata_len: usize,
) -> std::result::Result<(SafeTensorsMetadata, UserMetadata), String> {
    let metadata_str = std::str::from_utf8(&bytes[8..8 + metadata_len])
        .map_err(|e| format!("metadata is not valid UTF-8: {e}"))?;

    let raw_metadata: serde_json::Value =
        serde_json::from_str(metadata_str).map_err(|e| format!("JSON parsing failed: {e}"))?;

    let serde_json::Value::Object(map) = raw_metadata else {
        return Err("metadata is not a JSON object".to_string());
    };

    let mut metadata = SafeTensorsMetadata::new();
    let mut user_metadata = UserMetadata::new();

    for (key, value) in map {
        if key == "__metadata__" {
            if let serde_json::Value::Object(meta_map) = value {
                for (mk, mv) in meta_map {
                    if let serde_json::Value::String(s) = mv {
                        user_metadata.insert(mk, s);
                    }
                }
            }
            continue;
        }
        let tensor_meta: TensorMetadata = serde_json::from_value(value)
            .map_err(|e| format!("bad entry for tensor `{key}`: {e}"))?;
        metadata.insert(key, tensor_meta);
    }

    Ok((metadata, user_metadata))
}

fn extract_tensor(raw_data: &[u8], meta: &TensorMetadata) -> std::result::Result<Vec<f32>, String> {
    if meta.dtype != "F32" {
        return Err(format!("unsupported dtype {}, only F32 is stored", meta.dtype));
    }

    let [start, end] = meta.data_offsets;
    if start > end || end > raw_data.len() {
        return Err(format!(
            "invalid data offsets [{start}, {end}] for data size {}",
            raw_data.len()
        ));
    }

    let expected: usize = meta.shape.iter().product::<usize>() * 4;
    if end - start != expected {
        return Err(format!(
            "{} bytes stored for shape {:?}, expected {expected}",
            end - start,
            meta.shape
        ));
    }

    Ok(raw_data[start..end]
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
