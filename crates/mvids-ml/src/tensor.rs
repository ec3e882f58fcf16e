//! Conversions between host matrices and candle tensors.

use candle_core::{DType, Device, Tensor};
use mvids_core::{FeatureMatrix, MvidsError, Result};

/// Map a candle error into [`MvidsError::Model`] with context.
pub(crate) fn model_err(context: &'static str) -> impl Fn(candle_core::Error) -> MvidsError {
    move |e| MvidsError::Model(format!("{context}: {e}"))
}

/// Copy a feature matrix into a `[rows, cols]` f32 tensor.
pub fn matrix_to_tensor(x: &FeatureMatrix, device: &Device) -> Result<Tensor> {
    Tensor::from_slice(x.as_slice(), (x.rows(), x.cols()), device)
        .map_err(model_err("Failed to create feature tensor"))
}

/// Copy a `[rows, cols]` tensor back into a feature matrix.
pub fn tensor_to_matrix(t: &Tensor) -> Result<FeatureMatrix> {
    let (rows, cols) = t.dims2().map_err(model_err("Expected a rank-2 tensor"))?;
    let data: Vec<f32> = t
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1())
        .map_err(model_err("Failed to read tensor"))?;
    FeatureMatrix::new(rows, cols, data)
}

/// Class ids as a `[n]` u32 tensor, the dtype candle's cross-entropy expects.
pub fn labels_to_tensor(labels: &[usize], device: &Device) -> Result<Tensor> {
    let ids: Vec<u32> = labels.iter().map(|&l| l as u32).collect();
    Tensor::new(ids.as_slice(), device).map_err(model_err("Failed to create label tensor"))
}

/// Fail with [`MvidsError::DimensionMismatch`] unless `x` is `[batch, expected]`.
pub fn check_input_width(component: &str, x: &Tensor, expected: usize) -> Result<()> {
    let actual = match x.dims() {
        [_, cols] => *cols,
        dims => {
            return Err(MvidsError::Model(format!(
                "{component}: expected a [batch, features] tensor, got shape {dims:?}"
            )))
        }
    };
    if actual != expected {
        return Err(MvidsError::DimensionMismatch {
            component: component.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_tensor_round_trip() {
        let m = FeatureMatrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        let t = matrix_to_tensor(&m, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 3]);
        assert_eq!(tensor_to_matrix(&t).unwrap(), m);
    }

    #[test]
    fn test_check_input_width() {
        let t = Tensor::zeros((4, 20), DType::F32, &Device::Cpu).unwrap();
        assert!(check_input_width("router", &t, 20).is_ok());
        assert!(matches!(
            check_input_width("router", &t, 19),
            Err(MvidsError::DimensionMismatch {
                expected: 19,
                actual: 20,
                ..
            })
        ));
        let t3 = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(check_input_width("router", &t3, 3).is_err());
    }

    #[test]
    fn test_labels_to_tensor() {
        let t = labels_to_tensor(&[0, 2, 1], &Device::Cpu).unwrap();
        assert_eq!(t.to_vec1::<u32>().unwrap(), vec![0, 2, 1]);
    }
}
