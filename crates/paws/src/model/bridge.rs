//! Tensor bridge: conversions between event batches / host vectors and burn
//! tensors.

use burn::prelude::*;
use burn::tensor::TensorData;
use events::{EventBatch, SampleTag};

/// Convert an event batch to a `(len, n_features)` feature tensor.
///
/// # Panics
/// Panics if the batch is empty or its feature buffer is inconsistent.
pub fn batch_to_tensor<B: Backend>(batch: &EventBatch, device: &B::Device) -> Tensor<B, 2> {
    assert!(!batch.is_empty(), "batch must not be empty");
    assert!(batch.n_features > 0, "feature dimension must be > 0");
    assert_eq!(
        batch.features.len(),
        batch.len() * batch.n_features,
        "feature buffer has {} values, expected {} x {}",
        batch.features.len(),
        batch.len(),
        batch.n_features
    );
    Tensor::from_data(
        TensorData::new(batch.features.clone(), [batch.len(), batch.n_features]),
        device,
    )
}

/// Per-event indicator: 1 for mixed-sample events, 0 for reference events.
pub fn mixed_indicator<B: Backend>(tags: &[SampleTag], device: &B::Device) -> Tensor<B, 1> {
    let values: Vec<f32> = tags.iter().map(|t| t.target()).collect();
    Tensor::from_data(TensorData::new(values, [tags.len()]), device)
}

/// Convert host values to a 1D tensor.
pub fn values_to_tensor<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
    let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    let n = values.len();
    Tensor::from_data(TensorData::new(values, [n]), device)
}

/// Extract f64 values from a burn 1D tensor.
pub fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> Vec<f64> {
    tensor
        .into_data()
        .iter::<f32>()
        .map(|v| v as f64)
        .collect()
}

/// Extract f32 values from a burn 1D tensor.
pub fn tensor_to_f32_vec<B: Backend>(tensor: Tensor<B, 1>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Extract a single f64 scalar from a burn 1D tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f32 = tensor.into_scalar().elem();
    val as f64
}
