//! Read-only learned dictionaries and the [`InferenceLens`] handed to
//! interpretability and ablation code
//!
//! ```text
//! Untied:  codes = ReLU(x @ W_enc^T + b)     dict = rownorm(W_dec)
//! Tied:    codes = ReLU(x @ W^T + b)         dict = rownorm(W)
//!          (norm_encoder: W is row-normalized before encoding too)
//! Decode:  x_hat = codes @ dict
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Common interface of every dictionary variant.
pub trait LearnedDict: Send + Sync {
    /// Unit-norm dictionary rows, `[n_features, activation_dim]`
    fn get_learned_dict(&self) -> Result<Tensor>;

    /// Sparse codes for `[batch, activation_dim]` activations
    fn encode(&self, batch: &Tensor) -> Result<Tensor>;

    fn to_device(&mut self, device: &Device) -> Result<()>;

    fn n_features(&self) -> usize;

    fn activation_dim(&self) -> usize;

    /// Reconstruct activations from `[batch, n_features]` codes
    fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        Ok(codes.matmul(&self.get_learned_dict()?)?)
    }

    fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        self.decode(&self.encode(batch)?)
    }
}

/// Divide each row by its L2 norm (floored at 1e-8).
pub fn normalize_rows(t: &Tensor) -> Result<Tensor> {
    let norms = t.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-8)?;
    Ok(t.broadcast_div(&norms)?)
}

fn relu_affine(batch: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let pre = batch.matmul(&weight.t()?)?.broadcast_add(bias)?;
    Ok(pre.relu()?)
}

/// Dictionary with independent encoder and decoder weights
#[derive(Debug, Clone)]
pub struct UntiedSae {
    encoder: Tensor,      // [n_features, activation_dim]
    decoder: Tensor,      // [n_features, activation_dim]
    encoder_bias: Tensor, // [n_features]
}

impl UntiedSae {
    pub fn new(encoder: Tensor, decoder: Tensor, encoder_bias: Tensor) -> Result<Self> {
        anyhow::ensure!(
            encoder.dims() == decoder.dims(),
            "Encoder shape {:?} does not match decoder shape {:?}",
            encoder.dims(),
            decoder.dims()
        );
        let (n_features, _) = encoder.dims2()?;
        anyhow::ensure!(
            encoder_bias.dims() == [n_features],
            "Encoder bias must have shape [{n_features}], got {:?}",
            encoder_bias.dims()
        );
        Ok(Self {
            encoder: encoder.to_dtype(DType::F32)?,
            decoder: decoder.to_dtype(DType::F32)?,
            encoder_bias: encoder_bias.to_dtype(DType::F32)?,
        })
    }
}

impl LearnedDict for UntiedSae {
    fn get_learned_dict(&self) -> Result<Tensor> {
        normalize_rows(&self.decoder)
    }

    fn encode(&self, batch: &Tensor) -> Result<Tensor> {
        relu_affine(batch, &self.encoder, &self.encoder_bias)
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.encoder = self.encoder.to_device(device)?;
        self.decoder = self.decoder.to_device(device)?;
        self.encoder_bias = self.encoder_bias.to_device(device)?;
        Ok(())
    }

    fn n_features(&self) -> usize {
        self.encoder.dims()[0]
    }

    fn activation_dim(&self) -> usize {
        self.encoder.dims()[1]
    }
}

/// Dictionary whose decoder is the row-normalized encoder
#[derive(Debug, Clone)]
pub struct TiedSae {
    encoder: Tensor,
    encoder_bias: Tensor,
    norm_encoder: bool,
}

impl TiedSae {
    pub fn new(encoder: Tensor, encoder_bias: Tensor, norm_encoder: bool) -> Result<Self> {
        let (n_features, _) = encoder.dims2()?;
        anyhow::ensure!(
            encoder_bias.dims() == [n_features],
            "Encoder bias must have shape [{n_features}], got {:?}",
            encoder_bias.dims()
        );
        Ok(Self {
            encoder: encoder.to_dtype(DType::F32)?,
            encoder_bias: encoder_bias.to_dtype(DType::F32)?,
            norm_encoder,
        })
    }
}

impl LearnedDict for TiedSae {
    fn get_learned_dict(&self) -> Result<Tensor> {
        normalize_rows(&self.encoder)
    }

    fn encode(&self, batch: &Tensor) -> Result<Tensor> {
        if self.norm_encoder {
            relu_affine(batch, &normalize_rows(&self.encoder)?, &self.encoder_bias)
        } else {
            relu_affine(batch, &self.encoder, &self.encoder_bias)
        }
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.encoder = self.encoder.to_device(device)?;
        self.encoder_bias = self.encoder_bias.to_device(device)?;
        Ok(())
    }

    fn n_features(&self) -> usize {
        self.encoder.dims()[0]
    }

    fn activation_dim(&self) -> usize {
        self.encoder.dims()[1]
    }
}

/// Read-only handle on a trained dictionary.
///
/// Device placement is explicit: inputs must already live on [`Self::device`],
/// and [`Self::to_device`] is the only way to move the weights.
pub struct InferenceLens {
    dict: Box<dyn LearnedDict>,
    device: Device,
}

impl InferenceLens {
    pub fn new(dict: Box<dyn LearnedDict>, device: Device) -> Self {
        Self { dict, device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn n_features(&self) -> usize {
        self.dict.n_features()
    }

    pub fn activation_dim(&self) -> usize {
        self.dict.activation_dim()
    }

    /// Move every owned tensor to `device`.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.dict.to_device(device)?;
        self.device = device.clone();
        Ok(())
    }

    fn check_input(&self, t: &Tensor, last_dim: usize, what: &str) -> Result<()> {
        anyhow::ensure!(
            t.device().same_device(&self.device),
            "{what} live on {:?} but the lens is on {:?}; call to_device first",
            t.device(),
            self.device
        );
        let dims = t.dims();
        anyhow::ensure!(
            dims.len() == 2 && dims[1] == last_dim,
            "{what} must have shape [batch, {last_dim}], got {dims:?}"
        );
        Ok(())
    }

    pub fn encode(&self, activations: &Tensor) -> Result<Tensor> {
        self.check_input(activations, self.activation_dim(), "Activations")?;
        self.dict.encode(&activations.to_dtype(DType::F32)?)
    }

    pub fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        self.check_input(codes, self.n_features(), "Codes")?;
        self.dict.decode(codes)
    }

    pub fn forward(&self, activations: &Tensor) -> Result<Tensor> {
        self.decode(&self.encode(activations)?)
    }

    pub fn get_dictionary(&self) -> Result<Tensor> {
        self.dict.get_learned_dict()
    }
}
