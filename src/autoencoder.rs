//! Trainable sparse autoencoder with tied or untied weights
//!
//! Parameters live in [`candle_core::Var`]s so an optimizer can update them
//! in place. The dictionary rows (decoder when untied, the shared weight when
//! tied) are kept at unit L2 norm: on construction, at the start of every
//! forward pass and after every optimizer step.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::learned_dict::{normalize_rows, InferenceLens, LearnedDict, TiedSae, UntiedSae};

/// Weight sharing between encoder and decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DictKind {
    /// Independent encoder and decoder matrices
    Untied,
    /// Decoder is the row-normalized encoder
    Tied {
        /// Also row-normalize the encoder before encoding
        norm_encoder: bool,
    },
}

/// Loss of one forward pass
#[derive(Debug)]
pub struct LossTerms {
    /// `reconstruction + l1`, still attached to the autograd graph
    pub total: Tensor,
    pub reconstruction: f32,
    /// Already scaled by `l1_alpha`
    pub l1: f32,
    /// `[batch, n_dict_components]`
    pub codes: Tensor,
}

/// Linear encoder + ReLU, linear decoder onto unit-norm dictionary rows.
#[derive(Debug)]
pub struct SparseAutoencoder {
    kind: DictKind,
    l1_alpha: f64,
    /// `[n_dict, activation_dim]`
    encoder: Var,
    /// `[n_dict]`
    encoder_bias: Var,
    /// `[n_dict, activation_dim]`, untied only
    decoder: Option<Var>,
}

impl SparseAutoencoder {
    /// Fresh model. Dictionary rows get an orthogonal initialisation; the
    /// untied encoder and the bias are uniform in `±1/sqrt(activation_dim)`.
    pub fn new(
        activation_dim: usize,
        n_dict_components: usize,
        kind: DictKind,
        l1_alpha: f64,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        anyhow::ensure!(
            activation_dim > 0 && n_dict_components > 0,
            "Autoencoder needs positive sizes, got {n_dict_components}x{activation_dim}"
        );
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (activation_dim as f32).sqrt();
        let shape = (n_dict_components, activation_dim);

        let dictionary = Tensor::from_vec(
            orthogonal_init(n_dict_components, activation_dim, &mut rng),
            shape,
            device,
        )?;
        let bias = Tensor::from_vec(
            uniform_init(n_dict_components, bound, &mut rng),
            n_dict_components,
            device,
        )?;

        let (encoder, decoder) = match kind {
            DictKind::Untied => {
                let encoder = Tensor::from_vec(
                    uniform_init(n_dict_components * activation_dim, bound, &mut rng),
                    shape,
                    device,
                )?;
                (encoder, Some(dictionary))
            }
            DictKind::Tied { .. } => (dictionary, None),
        };
        let model = Self::from_tensors(kind, l1_alpha, encoder, bias, decoder)?;
        model.normalize_dictionary()?;
        Ok(model)
    }

    /// Rebuild a model from stored parameters (copied, never aliased).
    pub fn from_tensors(
        kind: DictKind,
        l1_alpha: f64,
        encoder: Tensor,
        encoder_bias: Tensor,
        decoder: Option<Tensor>,
    ) -> Result<Self> {
        let (n_dict, _) = encoder.dims2()?;
        anyhow::ensure!(
            encoder_bias.dims() == [n_dict],
            "Encoder bias must have shape [{n_dict}], got {:?}",
            encoder_bias.dims()
        );
        let decoder = match (kind, decoder) {
            (DictKind::Untied, Some(dec)) => {
                anyhow::ensure!(
                    dec.dims() == encoder.dims(),
                    "Decoder shape {:?} does not match encoder shape {:?}",
                    dec.dims(),
                    encoder.dims()
                );
                Some(Var::from_tensor(&dec.to_dtype(DType::F32)?.copy()?)?)
            }
            (DictKind::Untied, None) => anyhow::bail!("Untied autoencoder requires a decoder"),
            (DictKind::Tied { .. }, Some(_)) => {
                anyhow::bail!("Tied autoencoder must not carry a separate decoder")
            }
            (DictKind::Tied { .. }, None) => None,
        };
        Ok(Self {
            kind,
            l1_alpha,
            encoder: Var::from_tensor(&encoder.to_dtype(DType::F32)?.copy()?)?,
            encoder_bias: Var::from_tensor(&encoder_bias.to_dtype(DType::F32)?.copy()?)?,
            decoder,
        })
    }

    pub fn kind(&self) -> DictKind {
        self.kind
    }

    pub fn l1_alpha(&self) -> f64 {
        self.l1_alpha
    }

    pub fn set_l1_alpha(&mut self, l1_alpha: f64) {
        self.l1_alpha = l1_alpha;
    }

    pub fn n_dict_components(&self) -> usize {
        self.encoder.dims()[0]
    }

    pub fn activation_dim(&self) -> usize {
        self.encoder.dims()[1]
    }

    pub fn device(&self) -> &Device {
        self.encoder.device()
    }

    /// Trainable parameters, in a stable order
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = vec![self.encoder.clone(), self.encoder_bias.clone()];
        if let Some(dec) = &self.decoder {
            vars.push(dec.clone());
        }
        vars
    }

    /// The parameter holding the dictionary rows (decoder, or the tied encoder)
    pub(crate) fn dictionary_var(&self) -> &Var {
        self.decoder.as_ref().unwrap_or(&self.encoder)
    }

    /// Project every dictionary row back onto the unit sphere, in place.
    pub fn normalize_dictionary(&self) -> Result<()> {
        let var = self.dictionary_var();
        let normalized = normalize_rows(&var.as_tensor().detach())?;
        var.set(&normalized)?;
        Ok(())
    }

    fn encode(&self, batch: &Tensor) -> Result<Tensor> {
        let weight = match self.kind {
            DictKind::Tied { norm_encoder: true } => normalize_rows(self.encoder.as_tensor())?,
            _ => self.encoder.as_tensor().clone(),
        };
        let pre = batch
            .matmul(&weight.t()?)?
            .broadcast_add(self.encoder_bias.as_tensor())?;
        Ok(pre.relu()?)
    }

    fn dictionary(&self) -> Result<Tensor> {
        match &self.decoder {
            Some(dec) => Ok(dec.as_tensor().clone()),
            None => normalize_rows(self.encoder.as_tensor()),
        }
    }

    /// Returns `(reconstruction, codes)`.
    pub fn forward(&self, batch: &Tensor) -> Result<(Tensor, Tensor)> {
        let dims = batch.dims();
        anyhow::ensure!(
            dims.len() == 2 && dims[1] == self.activation_dim(),
            "Batch must have shape [batch, {}], got {dims:?}",
            self.activation_dim()
        );
        self.normalize_dictionary()?;
        let codes = self.encode(batch)?;
        let x_hat = codes.matmul(&self.dictionary()?)?;
        Ok((x_hat, codes))
    }

    /// `mse(x, x_hat) + l1_alpha * mean_b(sum_f |c|)`
    pub fn loss(&self, batch: &Tensor) -> Result<LossTerms> {
        let batch = batch.to_dtype(DType::F32)?;
        let (x_hat, codes) = self.forward(&batch)?;
        let reconstruction = (&batch - &x_hat)?.sqr()?.mean_all()?;
        let l1 = (codes.abs()?.sum(1)?.mean_all()? * self.l1_alpha)?;
        let total = (&reconstruction + &l1)?;
        Ok(LossTerms {
            reconstruction: reconstruction.to_scalar::<f32>()?,
            l1: l1.to_scalar::<f32>()?,
            total,
            codes,
        })
    }

    /// Snapshot of the unit-norm dictionary, detached from the parameters.
    pub fn learned_dict(&self) -> Result<Tensor> {
        Ok(normalize_rows(&self.dictionary_var().as_tensor().detach())?.copy()?)
    }

    /// Frozen copy of the current weights as a read-only lens.
    pub fn to_lens(&self) -> Result<InferenceLens> {
        let encoder = self.encoder.as_tensor().detach().copy()?;
        let bias = self.encoder_bias.as_tensor().detach().copy()?;
        let dict: Box<dyn LearnedDict> = match (self.kind, &self.decoder) {
            (DictKind::Untied, Some(dec)) => Box::new(UntiedSae::new(
                encoder,
                dec.as_tensor().detach().copy()?,
                bias,
            )?),
            (DictKind::Tied { norm_encoder }, _) => {
                Box::new(TiedSae::new(encoder, bias, norm_encoder)?)
            }
            (DictKind::Untied, None) => anyhow::bail!("Untied autoencoder lost its decoder"),
        };
        Ok(InferenceLens::new(dict, self.device().clone()))
    }

    /// Copy of the model on `device`. Optimizer state is not carried over.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let decoder = match &self.decoder {
            Some(dec) => Some(dec.as_tensor().to_device(device)?),
            None => None,
        };
        Self::from_tensors(
            self.kind,
            self.l1_alpha,
            self.encoder.as_tensor().to_device(device)?,
            self.encoder_bias.as_tensor().to_device(device)?,
            decoder,
        )
    }

    /// Named parameter tensors for serialization
    pub fn tensors(&self) -> Vec<(&'static str, Tensor)> {
        let mut out = vec![
            ("encoder", self.encoder.as_tensor().detach()),
            ("encoder_bias", self.encoder_bias.as_tensor().detach()),
        ];
        if let Some(dec) = &self.decoder {
            out.push(("decoder", dec.as_tensor().detach()));
        }
        out
    }
}

/// Row-major `[rows, cols]` matrix with orthonormal rows (rows <= cols) or
/// orthonormal columns (rows > cols), from the Q factor of a Gaussian matrix.
fn orthogonal_init<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Vec<f32> {
    let (r, c) = if rows >= cols {
        (rows, cols)
    } else {
        (cols, rows)
    };
    let gaussian = DMatrix::from_fn(r, c, |_, _| rng.sample::<f64, _>(StandardNormal));
    let q = gaussian.qr().q();
    let q = if rows >= cols { q } else { q.transpose() };

    let mut out = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            out.push(q[(i, j)] as f32);
        }
    }
    out
}

fn uniform_init<R: Rng + ?Sized>(len: usize, bound: f32, rng: &mut R) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
}
