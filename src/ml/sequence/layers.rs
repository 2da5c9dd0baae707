use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use super::{expect_dims, expect_len, matrix_from_rows, Layer, LayerSpec, Tensor};
use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Sigmoid,
    HardSigmoid,
    Tanh,
    Relu,
    Softmax,
}

impl Activation {
    fn tanh() -> Self {
        Activation::Tanh
    }

    fn sigmoid() -> Self {
        Activation::Sigmoid
    }

    fn linear() -> Self {
        Activation::Linear
    }

    pub fn apply(&self, values: DVector<f64>) -> DVector<f64> {
        match self {
            Activation::Linear => values,
            Activation::Sigmoid => values.map(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::HardSigmoid => values.map(|v| (0.2 * v + 0.5).clamp(0.0, 1.0)),
            Activation::Tanh => values.map(f64::tanh),
            Activation::Relu => values.map(|v| v.max(0.0)),
            Activation::Softmax => {
                let max = values.max();
                let exp = values.map(|v| (v - max).exp());
                let sum = exp.sum();
                exp / sum
            }
        }
    }
}

/// Layers that are the identity at inference time.
#[derive(Debug)]
pub struct Passthrough {
    class_name: &'static str,
}

impl Passthrough {
    pub fn input_layer(_: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        Ok(Box::new(Passthrough {
            class_name: "InputLayer",
        }))
    }

    pub fn dropout(_: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        Ok(Box::new(Passthrough {
            class_name: "Dropout",
        }))
    }
}

impl Layer for Passthrough {
    fn class_name(&self) -> &'static str {
        self.class_name
    }

    fn forward(&self, input: Tensor) -> Result<Tensor, ModelError> {
        Ok(input)
    }
}

/// Marks time steps whose features all equal `mask_value` as padding.
#[derive(Debug)]
pub struct Masking {
    mask_value: f64,
}

#[derive(Deserialize)]
struct MaskingConfig {
    #[serde(default)]
    mask_value: f64,
}

impl Masking {
    pub fn from_spec(spec: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        let config: MaskingConfig = spec.parse_config()?;
        Ok(Box::new(Masking {
            mask_value: config.mask_value,
        }))
    }
}

impl Layer for Masking {
    fn class_name(&self) -> &'static str {
        "Masking"
    }

    fn forward(&self, input: Tensor) -> Result<Tensor, ModelError> {
        let (mut values, previous) = match input {
            Tensor::Sequence { values, mask } => (values, mask),
            Tensor::Vector(_) => {
                return Err(ModelError::Evaluation("Masking expects a sequence".to_string()));
            }
        };

        let mut mask = Vec::with_capacity(values.nrows());
        for t in 0..values.nrows() {
            let keep = values.row(t).iter().any(|&v| v != self.mask_value)
                && previous.as_ref().map_or(true, |m| m[t]);
            if !keep {
                values.row_mut(t).fill(0.0);
            }
            mask.push(keep);
        }

        Ok(Tensor::Sequence {
            values,
            mask: Some(mask),
        })
    }
}

#[derive(Deserialize)]
struct DenseConfig {
    units: usize,
    #[serde(default = "Activation::linear")]
    activation: Activation,
}

#[derive(Deserialize)]
struct DenseWeights {
    kernel: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

/// Fully connected layer; applied per time step on sequences.
#[derive(Debug)]
pub struct Dense {
    /// `[units, in]`
    weights: DMatrix<f64>,
    bias: DVector<f64>,
    activation: Activation,
}

impl Dense {
    pub fn from_spec(spec: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        let config: DenseConfig = spec.parse_config()?;
        let weights: DenseWeights = spec.parse_weights()?;

        let kernel = matrix_from_rows(&weights.kernel, "kernel")?;
        expect_dims("kernel", &kernel, kernel.nrows(), config.units)?;
        expect_len("bias", &weights.bias, config.units)?;

        Ok(Box::new(Dense {
            weights: kernel.transpose(),
            bias: DVector::from_vec(weights.bias),
            activation: config.activation,
        }))
    }

    fn apply(&self, x: DVector<f64>) -> Result<DVector<f64>, ModelError> {
        if x.len() != self.weights.ncols() {
            return Err(ModelError::Shape {
                expected: self.weights.ncols(),
                got: x.len(),
            });
        }
        Ok(self.activation.apply(&self.weights * x + &self.bias))
    }
}

impl Layer for Dense {
    fn class_name(&self) -> &'static str {
        "Dense"
    }

    fn forward(&self, input: Tensor) -> Result<Tensor, ModelError> {
        match input {
            Tensor::Vector(x) => Ok(Tensor::Vector(self.apply(x)?)),
            Tensor::Sequence { values, mask } => {
                let rows = (0..values.nrows())
                    .map(|t| self.apply(values.row(t).transpose()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Tensor::Sequence {
                    values: stack_rows(&rows, self.bias.len()),
                    mask,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LstmConfig {
    units: usize,
    #[serde(default)]
    return_sequences: bool,
    #[serde(default)]
    go_backwards: bool,
    #[serde(default = "Activation::tanh")]
    activation: Activation,
    #[serde(default = "Activation::sigmoid")]
    recurrent_activation: Activation,
}

/// Keras weight layout; gate blocks are ordered input, forget, cell, output.
#[derive(Debug, Deserialize)]
pub struct LstmWeights {
    kernel: Vec<Vec<f64>>,
    recurrent_kernel: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

#[derive(Debug)]
pub struct Lstm {
    units: usize,
    /// `[4u, in]`
    input_weights: DMatrix<f64>,
    /// `[4u, u]`
    recurrent_weights: DMatrix<f64>,
    bias: DVector<f64>,
    activation: Activation,
    recurrent_activation: Activation,
    return_sequences: bool,
    go_backwards: bool,
}

impl Lstm {
    pub fn from_spec(spec: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        let config: LstmConfig = spec.parse_config()?;
        let weights: LstmWeights = spec.parse_weights()?;
        Ok(Box::new(Lstm::new(&config, weights)?))
    }

    pub fn new(config: &LstmConfig, weights: LstmWeights) -> Result<Self, ModelError> {
        let units = config.units;
        if units == 0 {
            return Err(ModelError::Format("LSTM units must be positive".to_string()));
        }

        let kernel = matrix_from_rows(&weights.kernel, "kernel")?;
        expect_dims("kernel", &kernel, kernel.nrows(), 4 * units)?;
        let recurrent = matrix_from_rows(&weights.recurrent_kernel, "recurrent_kernel")?;
        expect_dims("recurrent_kernel", &recurrent, units, 4 * units)?;
        expect_len("bias", &weights.bias, 4 * units)?;

        Ok(Self {
            units,
            input_weights: kernel.transpose(),
            recurrent_weights: recurrent.transpose(),
            bias: DVector::from_vec(weights.bias),
            activation: config.activation,
            recurrent_activation: config.recurrent_activation,
            return_sequences: config.return_sequences,
            go_backwards: config.go_backwards,
        })
    }

    /// Runs the recurrence. Masked steps carry state forward and emit zeros.
    ///
    /// Returns per-step outputs in input time order and the final hidden state.
    fn run(
        &self,
        values: &DMatrix<f64>,
        mask: Option<&[bool]>,
        reverse: bool,
    ) -> Result<(Vec<DVector<f64>>, DVector<f64>), ModelError> {
        let input_size = self.input_weights.ncols();
        if values.ncols() != input_size {
            return Err(ModelError::Shape {
                expected: input_size,
                got: values.ncols(),
            });
        }

        let u = self.units;
        let steps = values.nrows();
        let mut h = DVector::zeros(u);
        let mut c = DVector::zeros(u);
        let mut outputs = vec![DVector::zeros(u); steps];

        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..steps).rev())
        } else {
            Box::new(0..steps)
        };

        for t in order {
            if mask.map_or(false, |m| !m[t]) {
                continue;
            }

            let x = values.row(t).transpose();
            let z = &self.input_weights * x + &self.recurrent_weights * &h + &self.bias;

            let i = self.recurrent_activation.apply(z.rows(0, u).into_owned());
            let f = self.recurrent_activation.apply(z.rows(u, u).into_owned());
            let g = self.activation.apply(z.rows(2 * u, u).into_owned());
            let o = self.recurrent_activation.apply(z.rows(3 * u, u).into_owned());

            c = f.component_mul(&c) + i.component_mul(&g);
            h = o.component_mul(&self.activation.apply(c.clone()));
            outputs[t] = h.clone();
        }

        Ok((outputs, h))
    }
}

impl Layer for Lstm {
    fn class_name(&self) -> &'static str {
        "LSTM"
    }

    fn forward(&self, input: Tensor) -> Result<Tensor, ModelError> {
        let (values, mask) = match input {
            Tensor::Sequence { values, mask } => (values, mask),
            Tensor::Vector(_) => {
                return Err(ModelError::Evaluation("LSTM expects a sequence".to_string()));
            }
        };

        let (mut outputs, last) = self.run(&values, mask.as_deref(), self.go_backwards)?;
        if self.return_sequences {
            // a backwards layer emits its steps in processing order
            if self.go_backwards {
                outputs.reverse();
            }
            Ok(Tensor::Sequence {
                values: stack_rows(&outputs, self.units),
                mask,
            })
        } else {
            Ok(Tensor::Vector(last))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    Concat,
    Sum,
    Ave,
    Mul,
}

impl MergeMode {
    fn concat() -> Self {
        MergeMode::Concat
    }

    fn merge(&self, forward: &DVector<f64>, backward: &DVector<f64>) -> DVector<f64> {
        match self {
            MergeMode::Concat => DVector::from_iterator(
                forward.len() + backward.len(),
                forward.iter().chain(backward.iter()).copied(),
            ),
            MergeMode::Sum => forward + backward,
            MergeMode::Ave => (forward + backward) * 0.5,
            MergeMode::Mul => forward.component_mul(backward),
        }
    }

    fn width(&self, units: usize) -> usize {
        match self {
            MergeMode::Concat => 2 * units,
            _ => units,
        }
    }
}

#[derive(Deserialize)]
struct BidirectionalConfig {
    layer: LstmConfig,
    #[serde(default = "MergeMode::concat")]
    merge_mode: MergeMode,
}

#[derive(Deserialize)]
struct BidirectionalWeights {
    forward: LstmWeights,
    backward: LstmWeights,
}

/// Runs one LSTM forward and one backward in time and merges their outputs.
#[derive(Debug)]
pub struct Bidirectional {
    forward: Lstm,
    backward: Lstm,
    merge_mode: MergeMode,
    return_sequences: bool,
}

impl Bidirectional {
    pub fn from_spec(spec: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        let config: BidirectionalConfig = spec.parse_config()?;
        let weights: BidirectionalWeights = spec.parse_weights()?;

        let forward = Lstm::new(&config.layer, weights.forward)?;
        let backward = Lstm::new(&config.layer, weights.backward)?;
        if forward.input_weights.ncols() != backward.input_weights.ncols() {
            return Err(ModelError::Format(
                "forward and backward kernels disagree on input size".to_string(),
            ));
        }

        Ok(Box::new(Bidirectional {
            forward,
            backward,
            merge_mode: config.merge_mode,
            return_sequences: config.layer.return_sequences,
        }))
    }
}

impl Layer for Bidirectional {
    fn class_name(&self) -> &'static str {
        "Bidirectional"
    }

    fn forward(&self, input: Tensor) -> Result<Tensor, ModelError> {
        let (values, mask) = match input {
            Tensor::Sequence { values, mask } => (values, mask),
            Tensor::Vector(_) => {
                return Err(ModelError::Evaluation(
                    "Bidirectional expects a sequence".to_string(),
                ));
            }
        };

        let (fwd_steps, fwd_last) = self.forward.run(&values, mask.as_deref(), false)?;
        let (bwd_steps, bwd_last) = self.backward.run(&values, mask.as_deref(), true)?;

        if self.return_sequences {
            let merged: Vec<_> = fwd_steps
                .iter()
                .zip(bwd_steps.iter())
                .map(|(f, b)| self.merge_mode.merge(f, b))
                .collect();
            Ok(Tensor::Sequence {
                values: stack_rows(&merged, self.merge_mode.width(self.forward.units)),
                mask,
            })
        } else {
            Ok(Tensor::Vector(self.merge_mode.merge(&fwd_last, &bwd_last)))
        }
    }
}

fn stack_rows(rows: &[DVector<f64>], width: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), width, |r, c| rows[r][c])
}
