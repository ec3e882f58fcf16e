//! Owned, versioned parameter bundles.
//!
//! Every neural model in the pipeline draws its weights from exactly one
//! [`ParamBundle`]. The bundle owns the candle [`VarMap`]; models are built
//! from [`ParamBundle::var_builder`] and only the bundle's optimizer updates
//! it. [`ParamBundle::snapshot`] deep-copies the parameters so a frozen
//! version can be evaluated while training continues on the original.

use std::path::Path;

use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use mvids_core::{MvidsError, Result};

use crate::tensor::model_err;

/// A named, versioned set of model parameters.
pub struct ParamBundle {
    name: String,
    version: u64,
    varmap: VarMap,
    device: Device,
}

impl ParamBundle {
    /// Create an empty bundle. Parameters are created lazily by the first
    /// model built from [`ParamBundle::var_builder`].
    pub fn new(name: impl Into<String>, device: &Device) -> Self {
        Self {
            name: name.into(),
            version: 0,
            varmap: VarMap::new(),
            device: device.clone(),
        }
    }

    /// Bundle name (e.g. `"mvfl"`, `"router"`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of optimizer epochs applied to these parameters.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record that the parameters changed.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Underlying variable map (for optimizers).
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// A variable builder that creates or reuses this bundle's parameters.
    #[must_use]
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> Result<usize> {
        let data = self.lock()?;
        Ok(data.values().map(|v| v.elem_count()).sum())
    }

    /// Deep-copy the parameters into an independent bundle with the same
    /// name and version.
    pub fn snapshot(&self) -> Result<ParamBundle> {
        let copy = VarMap::new();
        {
            let source = self.lock()?;
            let mut target = copy
                .data()
                .lock()
                .map_err(|_| MvidsError::Model("parameter map lock poisoned".to_string()))?;
            for (name, var) in source.iter() {
                let tensor = var
                    .as_tensor()
                    .copy()
                    .map_err(model_err("Failed to copy parameter"))?;
                let var = Var::from_tensor(&tensor).map_err(model_err("Failed to wrap parameter"))?;
                target.insert(name.clone(), var);
            }
        }
        Ok(ParamBundle {
            name: self.name.clone(),
            version: self.version,
            varmap: copy,
            device: self.device.clone(),
        })
    }

    /// Overwrite these parameters in place with the values of `other`.
    ///
    /// Models built from this bundle see the restored values immediately.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `other` is missing a parameter or a
    /// shape differs.
    pub fn restore(&mut self, other: &ParamBundle) -> Result<()> {
        {
            let target = self.lock()?;
            let source = other.lock()?;
            for (name, var) in target.iter() {
                let src = source.get(name).ok_or_else(|| {
                    MvidsError::Config(format!(
                        "bundle '{}' has no parameter '{name}'",
                        other.name
                    ))
                })?;
                var.set(src.as_tensor()).map_err(|e| {
                    MvidsError::Config(format!("cannot restore parameter '{name}': {e}"))
                })?;
            }
        }
        self.version = other.version;
        Ok(())
    }

    /// Save the parameters as safetensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap
            .save(path)
            .map_err(|e| MvidsError::Model(format!("Failed to save bundle '{}': {e}", self.name)))
    }

    /// Load parameter values from a safetensors file.
    ///
    /// The model must already have been built from this bundle so that the
    /// parameter names and shapes exist.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap
            .load(path)
            .map_err(|e| MvidsError::Model(format!("Failed to load bundle '{}': {e}", self.name)))
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, std::collections::HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|_| MvidsError::Model("parameter map lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for ParamBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamBundle")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Module, Tensor};

    fn build(bundle: &ParamBundle) -> candle_nn::Linear {
        candle_nn::linear(3, 2, bundle.var_builder().pp("fc")).unwrap()
    }

    #[test]
    fn test_bundle_creates_parameters_lazily() {
        let bundle = ParamBundle::new("test", &Device::Cpu);
        assert_eq!(bundle.num_parameters().unwrap(), 0);
        let _fc = build(&bundle);
        assert_eq!(bundle.num_parameters().unwrap(), 3 * 2 + 2);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut bundle = ParamBundle::new("test", &Device::Cpu);
        let fc = build(&bundle);
        bundle.bump_version();
        let snap = bundle.snapshot().unwrap();
        assert_eq!(snap.version(), 1);

        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let before: Vec<f32> = fc.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        // Zero the live weights; the snapshot must keep the old values.
        for var in bundle.varmap().all_vars() {
            var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
        }
        let zeroed: Vec<f32> = fc.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(zeroed.iter().all(|v| *v == 0.0));

        bundle.restore(&snap).unwrap();
        let restored: Vec<f32> = fc.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fc.safetensors");

        let bundle = ParamBundle::new("fc", &Device::Cpu);
        let fc = build(&bundle);
        bundle.save(&path).unwrap();

        let mut other = ParamBundle::new("fc", &Device::Cpu);
        let fc2 = build(&other);
        other.load(&path).unwrap();

        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let a: Vec<f32> = fc.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = fc2.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let mut bundle = ParamBundle::new("fc", &Device::Cpu);
        let _fc = build(&bundle);
        assert!(bundle.load(Path::new("/nonexistent/fc.safetensors")).is_err());
    }
}
