//! Sequence regressors reconstructed from exported weights

use std::fmt::Debug;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

use super::persistence::ArtifactError;
use super::PredictError;

/// A pretrained model mapping one normalized window to one normalized
/// next-step target.
pub trait SequenceModel: Send + Sync + Debug {
    /// Expected `(timesteps, features)` of the input window.
    fn input_shape(&self) -> (usize, usize);

    /// Short identifier used in logs.
    fn kind(&self) -> &'static str;

    /// Predict the normalized target for one window.
    fn infer(&self, window: ArrayView2<'_, f64>) -> Result<f64, PredictError>;
}

fn check_input(model: &dyn SequenceModel, window: &ArrayView2<'_, f64>) -> Result<(), PredictError> {
    let expected = model.input_shape();
    if window.dim() != expected {
        return Err(PredictError::ShapeMismatch {
            what: "model input",
            expected,
            found: window.dim(),
        });
    }
    Ok(())
}

/// Build a rectangular matrix from row vectors.
pub(crate) fn matrix_from_rows(
    what: &str,
    rows: Vec<Vec<f64>>,
) -> Result<Array2<f64>, ArtifactError> {
    let n_rows = rows.len();
    let n_cols = rows.first().map(Vec::len).unwrap_or(0);
    if n_rows == 0 || n_cols == 0 {
        return Err(ArtifactError::Invalid(format!("{} is empty", what)));
    }
    if let Some(i) = rows.iter().position(|r| r.len() != n_cols) {
        return Err(ArtifactError::Invalid(format!(
            "{} row {} has {} values, expected {}",
            what,
            i,
            rows[i].len(),
            n_cols
        )));
    }

    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    if flat.iter().any(|v| !v.is_finite()) {
        return Err(ArtifactError::Invalid(format!("{} has non-finite values", what)));
    }

    Array2::from_shape_vec((n_rows, n_cols), flat)
        .map_err(|e| ArtifactError::Invalid(format!("{}: {}", what, e)))
}

/// Weighted sum over every `(timestep, feature)` cell plus a bias.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSequenceModel {
    weights: Array2<f64>,
    bias: f64,
}

impl LinearSequenceModel {
    pub fn new(weights: Array2<f64>, bias: f64) -> Self {
        Self { weights, bias }
    }

    pub fn from_rows(weights: Vec<Vec<f64>>, bias: f64) -> Result<Self, ArtifactError> {
        if !bias.is_finite() {
            return Err(ArtifactError::Invalid("linear bias is non-finite".into()));
        }
        Ok(Self::new(matrix_from_rows("linear weights", weights)?, bias))
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }
}

impl SequenceModel for LinearSequenceModel {
    fn input_shape(&self) -> (usize, usize) {
        self.weights.dim()
    }

    fn kind(&self) -> &'static str {
        "linear"
    }

    fn infer(&self, window: ArrayView2<'_, f64>) -> Result<f64, PredictError> {
        check_input(self, &window)?;
        Ok((&window * &self.weights).sum() + self.bias)
    }
}

/// Single-layer LSTM followed by a dense unit.
///
/// Weight layout follows the Keras export: `kernel` is `features x 4H`,
/// `recurrent_kernel` is `H x 4H`, gate blocks ordered input, forget,
/// cell, output.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmSequenceModel {
    sequence_length: usize,
    hidden_size: usize,
    kernel: Array2<f64>,
    recurrent_kernel: Array2<f64>,
    bias: Array1<f64>,
    dense_kernel: Array1<f64>,
    dense_bias: f64,
}

impl LstmSequenceModel {
    pub fn new(
        sequence_length: usize,
        kernel: Array2<f64>,
        recurrent_kernel: Array2<f64>,
        bias: Array1<f64>,
        dense_kernel: Array1<f64>,
        dense_bias: f64,
    ) -> Result<Self, ArtifactError> {
        let hidden_size = recurrent_kernel.nrows();
        let gates = 4 * hidden_size;

        if sequence_length == 0 || hidden_size == 0 {
            return Err(ArtifactError::Invalid(
                "lstm needs a non-zero sequence length and hidden size".into(),
            ));
        }
        if kernel.ncols() != gates || recurrent_kernel.ncols() != gates {
            return Err(ArtifactError::Invalid(format!(
                "lstm kernels must have {} columns, found {} and {}",
                gates,
                kernel.ncols(),
                recurrent_kernel.ncols()
            )));
        }
        if bias.len() != gates {
            return Err(ArtifactError::Invalid(format!(
                "lstm bias has {} values, expected {}",
                bias.len(),
                gates
            )));
        }
        if dense_kernel.len() != hidden_size {
            return Err(ArtifactError::Invalid(format!(
                "dense kernel has {} values, expected {}",
                dense_kernel.len(),
                hidden_size
            )));
        }
        let all_finite = bias.iter().chain(dense_kernel.iter()).all(|v| v.is_finite())
            && dense_bias.is_finite();
        if !all_finite {
            return Err(ArtifactError::Invalid("lstm has non-finite parameters".into()));
        }

        Ok(Self {
            sequence_length,
            hidden_size,
            kernel,
            recurrent_kernel,
            bias,
            dense_kernel,
            dense_bias,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn step(&self, x: ArrayView1<'_, f64>, h: &Array1<f64>, c: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
        let n = self.hidden_size;
        let z = x.dot(&self.kernel) + h.dot(&self.recurrent_kernel) + &self.bias;

        let input = z.slice(s![0..n]).mapv(sigmoid);
        let forget = z.slice(s![n..2 * n]).mapv(sigmoid);
        let cell = z.slice(s![2 * n..3 * n]).mapv(f64::tanh);
        let output = z.slice(s![3 * n..4 * n]).mapv(sigmoid);

        let c_next = &forget * c + &input * &cell;
        let h_next = &output * &c_next.mapv(f64::tanh);
        (h_next, c_next)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl SequenceModel for LstmSequenceModel {
    fn input_shape(&self) -> (usize, usize) {
        (self.sequence_length, self.kernel.nrows())
    }

    fn kind(&self) -> &'static str {
        "lstm"
    }

    fn infer(&self, window: ArrayView2<'_, f64>) -> Result<f64, PredictError> {
        check_input(self, &window)?;

        let mut h = Array1::<f64>::zeros(self.hidden_size);
        let mut c = Array1::<f64>::zeros(self.hidden_size);
        for row in window.rows() {
            let (h_next, c_next) = self.step(row, &h, &c);
            h = h_next;
            c = c_next;
        }

        Ok(h.dot(&self.dense_kernel) + self.dense_bias)
    }
}
