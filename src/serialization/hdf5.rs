//! Keras-layout HDF5 archives (feature `hdf5`).

use super::{StoredWeight, WeightArchive};
use crate::error::{FcnError, Result};
use hdf5::types::{FixedAscii, VarLenUnicode};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// An open HDF5 weight file. Datasets are read lazily per layer.
pub(super) struct Hdf5Archive {
    path: PathBuf,
    file: hdf5::File,
    layer_names: Vec<String>,
}

impl Hdf5Archive {
    pub(super) fn open(path: &Path) -> Result<Self> {
        let err = |e: hdf5::Error| FcnError::archive(path, e.to_string());
        let file = hdf5::File::open(path).map_err(err)?;
        let layer_names = read_names(&file.attr("layer_names").map_err(err)?).map_err(err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            layer_names,
        })
    }
}

/// Keras writes name lists as fixed-length byte strings; h5py 3 may write
/// variable-length UTF-8 instead.
fn read_names(attr: &hdf5::Attribute) -> hdf5::Result<Vec<String>> {
    if let Ok(names) = attr.read_raw::<FixedAscii<256>>() {
        return Ok(names.iter().map(|n| n.as_str().to_owned()).collect());
    }
    let names = attr.read_raw::<VarLenUnicode>()?;
    Ok(names.iter().map(|n| n.as_str().to_owned()).collect())
}

impl WeightArchive for Hdf5Archive {
    fn layer_names(&self) -> &[String] {
        &self.layer_names
    }

    fn layer_weights(&self, layer: &str) -> Result<Vec<StoredWeight>> {
        let err = |e: hdf5::Error| FcnError::archive(&self.path, format!("{layer}: {e}"));
        let group = self.file.group(layer).map_err(err)?;
        let weight_names = match group.attr("weight_names") {
            Ok(attr) => read_names(&attr).map_err(err)?,
            // Weightless layers may omit the attribute
            Err(_) => return Ok(Vec::new()),
        };

        weight_names
            .into_iter()
            .map(|name| {
                let dataset = group.dataset(&name).map_err(err)?;
                let data = dataset.read_raw::<f32>().map_err(err)?;
                StoredWeight::new(name, dataset.shape(), data)
            })
            .collect()
    }
}

pub(super) fn save(path: &Path, layers: &[(String, Vec<StoredWeight>)]) -> Result<()> {
    let err = |e: hdf5::Error| FcnError::archive(path, e.to_string());
    let file = hdf5::File::create(path).map_err(err)?;
    write_names(&file, "layer_names", layers.iter().map(|(n, _)| n.as_str()), path)?;

    for (layer, weights) in layers {
        let group = file.create_group(layer).map_err(err)?;
        write_names(&group, "weight_names", weights.iter().map(|w| w.name.as_str()), path)?;
        for weight in weights {
            let (parent, leaf) = parent_group(&group, &weight.name).map_err(err)?;
            let dataset = parent
                .new_dataset::<f32>()
                .shape(weight.shape.as_slice())
                .create(leaf)
                .map_err(err)?;
            dataset.write_raw(&weight.data).map_err(err)?;
        }
    }
    Ok(())
}

/// Group holding the dataset `name`, creating the groups of a
/// `layer/kernel:0` style path on the way.
fn parent_group<'n>(group: &hdf5::Group, name: &'n str) -> hdf5::Result<(hdf5::Group, &'n str)> {
    let Some((dirs, leaf)) = name.rsplit_once('/') else {
        return Ok((group.clone(), name));
    };
    let mut current = group.clone();
    for part in dirs.split('/') {
        current = match current.group(part) {
            Ok(existing) => existing,
            Err(_) => current.create_group(part)?,
        };
    }
    Ok((current, leaf))
}

fn write_names<'a>(
    location: &hdf5::Location,
    attr_name: &str,
    names: impl Iterator<Item = &'a str>,
    path: &Path,
) -> Result<()> {
    let names = names
        .map(VarLenUnicode::from_str)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FcnError::archive(path, format!("unstorable name: {e}")))?;
    let attr = location
        .new_attr::<VarLenUnicode>()
        .shape(names.len())
        .create(attr_name)
        .map_err(|e| FcnError::archive(path, e.to_string()))?;
    attr.write_raw(&names)
        .map_err(|e| FcnError::archive(path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hdf5_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("weights.h5");
        let layers = vec![
            (
                "block1_conv1".to_string(),
                vec![StoredWeight::new("block1_conv1/kernel:0", vec![1, 1, 1, 2], vec![0.5, -1.5])
                    .expect("weight")],
            ),
            ("block1_pool".to_string(), Vec::new()),
        ];
        save(&path, &layers).expect("save");

        let archive = Hdf5Archive::open(&path).expect("open");
        assert_eq!(archive.layer_names(), &["block1_conv1", "block1_pool"]);
        let weights = archive.layer_weights("block1_conv1").expect("weights");
        assert_eq!(weights, layers[0].1);
    }
}
