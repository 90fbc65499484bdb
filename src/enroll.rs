//! Enrollment collaborator surface.
//!
//! Enrollment turns a reference recording of the target speaker into the
//! fixed embedding vector injected into every chunk's inference. The model
//! that does this is external; the core only defines the provider interface
//! and the JSON persistence of its product, so an embedding enrolled once
//! can be reloaded for later streams.

use std::fs::File;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::registry::{BufferRole, ShapeRegistry};
use crate::{Error, Result};

/// Produces one `Embedding`-shaped vector from a reference recording. The
/// core treats the result as opaque data.
pub trait EnrollmentProvider {
    fn enroll(&mut self, reference: &Tensor) -> Result<Tensor>;
}

/// Write an embedding as a flat JSON float array.
pub fn save_embedding(path: impl AsRef<Path>, embedding: &Tensor) -> Result<()> {
    let values = embedding.flatten_all()?.to_vec1::<f32>()?;
    let file = File::create(path)?;
    serde_json::to_writer(file, &values)?;
    Ok(())
}

/// Read an embedding back, validating its length against the registry's
/// `Embedding` role before reshaping.
pub fn load_embedding(path: impl AsRef<Path>, registry: &ShapeRegistry) -> Result<Tensor> {
    let file = File::open(path)?;
    let values: Vec<f32> = serde_json::from_reader(file)?;
    let spec = registry.spec(BufferRole::Embedding)?;
    let expected: usize = spec.shape.iter().product();
    if values.len() != expected {
        return Err(Error::ShapeMismatch {
            context: "embedding file".to_string(),
            expected: spec.shape.clone(),
            got: vec![values.len()],
        });
    }
    let tensor = Tensor::from_vec(values, spec.shape.clone(), &Device::Cpu)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ShapeRegistry {
        ShapeRegistry::waveformer(
            &[1, 2, 192],
            &[1, 256],
            &[1, 4, 2, 97],
            &[1, 4, 2, 97],
            &[1, 2, 96],
            &[1, 2, 192],
        )
        .unwrap()
    }

    #[test]
    fn test_embedding_file_round_trip() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedding.json");

        let data: Vec<f32> = (0..256).map(|i| i as f32 * 0.25).collect();
        let embedding = Tensor::from_vec(data.clone(), (1, 256), &Device::Cpu).unwrap();
        save_embedding(&path, &embedding).unwrap();

        let loaded = load_embedding(&path, &registry).unwrap();
        assert_eq!(loaded.dims(), &[1, 256]);
        assert_eq!(loaded.flatten_all().unwrap().to_vec1::<f32>().unwrap(), data);
        registry.validate(BufferRole::Embedding, &loaded).unwrap();
    }

    #[test]
    fn test_wrong_length_embedding_file_is_rejected() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.json");
        std::fs::write(&path, "[1.0, 2.0, 3.0]").unwrap();
        assert!(matches!(
            load_embedding(&path, &registry),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_provider_output_feeds_set_embedding() {
        struct ConstantEnroller(Vec<f32>);
        impl EnrollmentProvider for ConstantEnroller {
            fn enroll(&mut self, _reference: &Tensor) -> crate::Result<Tensor> {
                Ok(Tensor::from_vec(self.0.clone(), (1, 256), &Device::Cpu)?)
            }
        }

        let registry = registry();
        let mut enroller = ConstantEnroller(vec![0.5; 256]);
        let reference = Tensor::zeros(&[1, 2, 80000], candle_core::DType::F32, &Device::Cpu).unwrap();
        let embedding = enroller.enroll(&reference).unwrap();
        registry.validate(BufferRole::Embedding, &embedding).unwrap();
    }
}
