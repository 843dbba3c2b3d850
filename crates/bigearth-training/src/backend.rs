//! Backend selection
//!
//! NdArray on the CPU by default; the `cuda` feature switches to the CUDA
//! backend.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn::backend::Cuda;

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Get the default device (first GPU with `cuda`, otherwise the CPU)
pub fn default_device() -> <DefaultBackend as Backend>::Device {
    Default::default()
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }
    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}
