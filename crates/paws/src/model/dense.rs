use burn::module::Param;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;

/// Configuration for a fully connected layer with seeded initialization.
#[derive(Config, Debug)]
pub struct DenseConfig {
    /// Input dimension.
    pub d_input: usize,
    /// Output dimension.
    pub d_output: usize,
    /// Whether to include a bias term.
    #[config(default = true)]
    pub bias: bool,
}

/// Linear layer whose initial weights come from a caller-provided RNG.
///
/// The backend's global RNG is never touched, so two layers built from
/// identically seeded generators are bit-identical regardless of what other
/// threads are doing.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    /// Weight matrix, shape (d_output, d_input). Kaiming-uniform initialized.
    pub(crate) weight: Param<Tensor<B, 2>>,
    /// Optional bias, shape (d_output,). Zero initialized.
    pub(crate) bias: Option<Param<Tensor<B, 1>>>,
}

impl DenseConfig {
    /// Initialize a Dense layer.
    ///
    /// Weight uses Kaiming (He) uniform initialization:
    /// `U(-sqrt(6/fan_in), sqrt(6/fan_in))`. Bias is zero-initialized.
    pub fn init<B: Backend, R: Rng>(&self, rng: &mut R, device: &B::Device) -> Dense<B> {
        let bound = (6.0 / self.d_input as f64).sqrt();
        let values: Vec<f32> = (0..self.d_output * self.d_input)
            .map(|_| rng.gen_range(-bound..bound) as f32)
            .collect();
        let weight = Tensor::from_data(
            TensorData::new(values, [self.d_output, self.d_input]),
            device,
        );

        let bias = if self.bias {
            Some(Param::from_tensor(Tensor::zeros([self.d_output], device)))
        } else {
            None
        };

        Dense {
            weight: Param::from_tensor(weight),
            bias,
        }
    }
}

impl<B: Backend> Dense<B> {
    /// Input shape `(batch, d_input)`, output shape `(batch, d_output)`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let output = input.matmul(self.weight.val().transpose());
        match &self.bias {
            Some(b) => output + b.val().unsqueeze_dim::<2>(0),
            None => output,
        }
    }
}
