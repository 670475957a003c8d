//! Mobile graph
//!
//! The artifact bundled with the app: a flat table of tensors, a table of
//! constant buffers and a list of operators over tensor indices. Activations
//! are NHWC, conv filters are OHWI and fully connected weights are
//! `[out, in]`. The batch dimension is fixed to 1 in `shape` and declared
//! dynamic (`-1`) in `shape_signature`.

use std::fs;
use std::path::Path;

use half::f16;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{OptimizationPolicy, SupportedOps, WeightPrecision};
use crate::graph::{decode_framed, encode_framed};
use crate::utils::error::{ExportError, Result};

pub const ARTIFACT_MAGIC: &[u8; 4] = b"MGPH";
pub const ARTIFACT_VERSION: u32 = 1;
pub const ARTIFACT_EXTENSION: &str = "mgph";

/// Constant tensor storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Buffer {
    F32(Vec<f32>),
    /// IEEE half precision bit patterns
    F16(Vec<u16>),
    /// Symmetric int8 with one scale per slice along `axis`
    Int8 {
        values: Vec<i8>,
        scales: Vec<f32>,
        axis: usize,
    },
}

impl Buffer {
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(data) => data.len(),
            Buffer::F16(data) => data.len(),
            Buffer::Int8 { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the buffer occupies on device
    pub fn byte_size(&self) -> usize {
        match self {
            Buffer::F32(data) => data.len() * 4,
            Buffer::F16(data) => data.len() * 2,
            Buffer::Int8 { values, scales, .. } => values.len() + scales.len() * 4,
        }
    }

    pub fn precision(&self) -> &'static str {
        match self {
            Buffer::F32(_) => "float32",
            Buffer::F16(_) => "float16",
            Buffer::Int8 { .. } => "int8",
        }
    }

    /// Float values of the buffer
    ///
    /// Int8 buffers are only ever quantized along axis 0, so each scale
    /// covers one contiguous run of `len / scales.len()` values.
    pub fn dequantize(&self) -> Result<Vec<f32>> {
        match self {
            Buffer::F32(data) => Ok(data.clone()),
            Buffer::F16(bits) => Ok(bits.iter().map(|&b| f16::from_bits(b).to_f32()).collect()),
            Buffer::Int8 { values, scales, axis } => {
                if *axis != 0 || scales.is_empty() || values.len() % scales.len() != 0 {
                    return Err(ExportError::Serialization(format!(
                        "int8 buffer of {} values cannot be split into {} slices along axis {}",
                        values.len(),
                        scales.len(),
                        axis
                    )));
                }
                let run = values.len() / scales.len();
                Ok(values
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| v as f32 * scales[i / run])
                    .collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileTensor {
    pub name: String,
    pub shape: Vec<usize>,
    /// Like `shape`, with `-1` where the size is only known at run time
    pub shape_signature: Vec<i64>,
    /// Index into the buffer table for constants
    pub buffer: Option<usize>,
}

impl MobileTensor {
    pub fn is_constant(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    Same,
    Valid,
}

/// Activation fused into the producing operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    None,
    Relu,
}

/// Operator set an operator belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpSet {
    Builtin,
    Select,
}

/// Graph operator; every index refers to the tensor table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    Conv2d {
        input: usize,
        filter: usize,
        bias: Option<usize>,
        output: usize,
        stride: [usize; 2],
        padding: Padding,
        activation: Activation,
    },
    MaxPool2d {
        input: usize,
        output: usize,
        filter: [usize; 2],
        stride: [usize; 2],
        padding: Padding,
    },
    /// Mean over the listed NHWC axes
    Mean {
        input: usize,
        output: usize,
        axes: Vec<usize>,
        keep_dims: bool,
    },
    Reshape {
        input: usize,
        output: usize,
        new_shape: Vec<i64>,
    },
    FullyConnected {
        input: usize,
        weights: usize,
        bias: Option<usize>,
        output: usize,
        activation: Activation,
    },
    Softmax {
        input: usize,
        output: usize,
        beta: f32,
    },
    Relu {
        input: usize,
        output: usize,
    },
    /// Inference batch-norm over the channel axis
    BatchNorm {
        input: usize,
        scale: usize,
        offset: usize,
        mean: usize,
        variance: usize,
        output: usize,
        epsilon: f32,
    },
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Conv2d { .. } => "CONV_2D",
            Operator::MaxPool2d { .. } => "MAX_POOL_2D",
            Operator::Mean { .. } => "MEAN",
            Operator::Reshape { .. } => "RESHAPE",
            Operator::FullyConnected { .. } => "FULLY_CONNECTED",
            Operator::Softmax { .. } => "SOFTMAX",
            Operator::Relu { .. } => "RELU",
            Operator::BatchNorm { .. } => "BATCH_NORM",
        }
    }

    pub fn op_set(&self) -> OpSet {
        match self {
            Operator::BatchNorm { .. } => OpSet::Select,
            _ => OpSet::Builtin,
        }
    }

    pub fn inputs(&self) -> Vec<usize> {
        match self {
            Operator::Conv2d { input, filter, bias, .. } => {
                let mut inputs = vec![*input, *filter];
                inputs.extend(bias);
                inputs
            }
            Operator::FullyConnected { input, weights, bias, .. } => {
                let mut inputs = vec![*input, *weights];
                inputs.extend(bias);
                inputs
            }
            Operator::BatchNorm {
                input,
                scale,
                offset,
                mean,
                variance,
                ..
            } => vec![*input, *scale, *offset, *mean, *variance],
            Operator::MaxPool2d { input, .. }
            | Operator::Mean { input, .. }
            | Operator::Reshape { input, .. }
            | Operator::Softmax { input, .. }
            | Operator::Relu { input, .. } => vec![*input],
        }
    }

    pub fn output(&self) -> usize {
        match self {
            Operator::Conv2d { output, .. }
            | Operator::MaxPool2d { output, .. }
            | Operator::Mean { output, .. }
            | Operator::Reshape { output, .. }
            | Operator::FullyConnected { output, .. }
            | Operator::Softmax { output, .. }
            | Operator::Relu { output, .. }
            | Operator::BatchNorm { output, .. } => *output,
        }
    }

    /// Weight tensor eligible for int8 quantization
    pub fn quantizable_weight(&self) -> Option<usize> {
        match self {
            Operator::Conv2d { filter, .. } => Some(*filter),
            Operator::FullyConnected { weights, .. } => Some(*weights),
            _ => None,
        }
    }
}

/// How an artifact came to be
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactOrigin {
    /// Converted from the trained checkpoint
    Bridged { architecture: String },
    /// Untrained stand-in with the same I/O contract
    Placeholder,
}

impl std::fmt::Display for ArtifactOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactOrigin::Bridged { architecture } => write!(f, "bridged ({})", architecture),
            ArtifactOrigin::Placeholder => write!(f, "placeholder (untrained)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileGraph {
    pub origin: ArtifactOrigin,
    /// Optimization applied to the buffers; `None` while still plain float32
    pub policy: Option<OptimizationPolicy>,
    pub tensors: Vec<MobileTensor>,
    pub buffers: Vec<Buffer>,
    pub operators: Vec<Operator>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// Size and composition of a mobile graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSummary {
    pub origin: ArtifactOrigin,
    pub operators: usize,
    pub select_operators: usize,
    pub tensors: usize,
    pub parameters: usize,
    pub weight_bytes: usize,
    pub precision: String,
}

impl MobileGraph {
    pub fn is_placeholder(&self) -> bool {
        self.origin == ArtifactOrigin::Placeholder
    }

    pub fn tensor(&self, index: usize) -> Result<&MobileTensor> {
        self.tensors.get(index).ok_or_else(|| {
            ExportError::Serialization(format!("tensor index {} out of range", index))
        })
    }

    pub fn input_tensor(&self) -> Result<&MobileTensor> {
        let index = self
            .inputs
            .first()
            .ok_or_else(|| ExportError::Serialization("graph declares no input".to_string()))?;
        self.tensor(*index)
    }

    pub fn output_tensor(&self) -> Result<&MobileTensor> {
        let index = self
            .outputs
            .first()
            .ok_or_else(|| ExportError::Serialization("graph declares no output".to_string()))?;
        self.tensor(*index)
    }

    /// Check internal consistency and operator-set compliance
    pub fn check(&self, supported_ops: SupportedOps) -> Result<()> {
        for (index, tensor) in self.tensors.iter().enumerate() {
            if tensor.shape.contains(&0) {
                return Err(ExportError::ConversionError(format!(
                    "tensor {} '{}' has an empty dimension {:?}",
                    index, tensor.name, tensor.shape
                )));
            }
            if tensor.shape.len() != tensor.shape_signature.len() {
                return Err(ExportError::ConversionError(format!(
                    "tensor {} '{}' has mismatched shape and signature",
                    index, tensor.name
                )));
            }
            if let Some(buffer) = tensor.buffer {
                let stored = self.buffers.get(buffer).ok_or_else(|| {
                    ExportError::ConversionError(format!(
                        "tensor '{}' points at missing buffer {}",
                        tensor.name, buffer
                    ))
                })?;
                if stored.len() != tensor.element_count() {
                    return Err(ExportError::ConversionError(format!(
                        "tensor '{}' of shape {:?} has {} stored values",
                        tensor.name,
                        tensor.shape,
                        stored.len()
                    )));
                }
            }
        }

        let mut written = vec![false; self.tensors.len()];
        for &index in &self.inputs {
            self.tensor(index)?;
            written[index] = true;
        }

        for op in &self.operators {
            for index in op.inputs() {
                let tensor = self.tensors.get(index).ok_or_else(|| {
                    ExportError::ConversionError(format!("{} reads missing tensor {}", op.name(), index))
                })?;
                if !tensor.is_constant() && !written[index] {
                    return Err(ExportError::ConversionError(format!(
                        "{} reads '{}' before it is written",
                        op.name(),
                        tensor.name
                    )));
                }
            }
            let output = op.output();
            if output >= self.tensors.len() || self.tensors[output].is_constant() {
                return Err(ExportError::ConversionError(format!(
                    "{} writes an invalid tensor {}",
                    op.name(),
                    output
                )));
            }
            let inferred = infer_shape(op, &self.tensors)?;
            if inferred != self.tensors[output].shape {
                return Err(ExportError::ConversionError(format!(
                    "{} produces {:?} but '{}' is declared {:?}",
                    op.name(),
                    inferred,
                    self.tensors[output].name,
                    self.tensors[output].shape
                )));
            }
            written[output] = true;

            if op.op_set() == OpSet::Select && supported_ops == SupportedOps::BuiltinsOnly {
                return Err(ExportError::ConversionError(format!(
                    "{} needs select operators, which the builtins-only policy forbids",
                    op.name()
                )));
            }
        }

        for &index in &self.outputs {
            if !written.get(index).copied().unwrap_or(false) {
                return Err(ExportError::ConversionError(format!(
                    "graph output {} is never written",
                    index
                )));
            }
        }

        Ok(())
    }

    pub fn summary(&self) -> GraphSummary {
        let precision = match self.policy {
            Some(policy) if policy.weight_precision == WeightPrecision::Float16 => "float16",
            Some(policy) if policy.default_quantization => "int8 weights / float32",
            _ => "float32",
        };

        GraphSummary {
            origin: self.origin.clone(),
            operators: self.operators.len(),
            select_operators: self
                .operators
                .iter()
                .filter(|op| op.op_set() == OpSet::Select)
                .count(),
            tensors: self.tensors.len(),
            parameters: self.buffers.iter().map(Buffer::len).sum(),
            weight_bytes: self.buffers.iter().map(Buffer::byte_size).sum(),
            precision: precision.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_framed(ARTIFACT_MAGIC, ARTIFACT_VERSION, self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_framed(ARTIFACT_MAGIC, ARTIFACT_VERSION, bytes)
    }

    /// Write the artifact, overwriting any previous one; returns its size
    pub fn write(&self, path: &Path) -> Result<usize> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, &bytes)?;
        info!("Artifact saved to: {:?} ({} bytes)", path, bytes.len());
        Ok(bytes.len())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

/// Incremental construction of a [`MobileGraph`] with shape inference
#[derive(Debug, Default)]
pub struct MobileGraphBuilder {
    tensors: Vec<MobileTensor>,
    buffers: Vec<Buffer>,
    operators: Vec<Operator>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl MobileGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shape(&self, tensor: usize) -> Result<&[usize]> {
        shape_of(&self.tensors, tensor)
    }

    fn activation(&mut self, name: &str, shape: Vec<usize>) -> usize {
        let mut shape_signature: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        if let Some(batch) = shape_signature.first_mut() {
            *batch = -1;
        }
        self.tensors.push(MobileTensor {
            name: name.to_string(),
            shape,
            shape_signature,
            buffer: None,
        });
        self.tensors.len() - 1
    }

    /// Declare a graph input with a dynamic batch dimension
    pub fn add_input(&mut self, name: &str, shape: &[usize]) -> usize {
        let index = self.activation(name, shape.to_vec());
        self.inputs.push(index);
        index
    }

    /// Add a float32 constant
    pub fn add_constant(&mut self, name: &str, shape: &[usize], data: Vec<f32>) -> Result<usize> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ExportError::ConversionError(format!(
                "constant '{}' of shape {:?} got {} values",
                name,
                shape,
                data.len()
            )));
        }
        self.buffers.push(Buffer::F32(data));
        self.tensors.push(MobileTensor {
            name: name.to_string(),
            shape: shape.to_vec(),
            shape_signature: shape.iter().map(|&d| d as i64).collect(),
            buffer: Some(self.buffers.len() - 1),
        });
        Ok(self.tensors.len() - 1)
    }

    pub fn mark_output(&mut self, tensor: usize) {
        self.outputs.push(tensor);
    }

    /// Register the output tensor of `op` with its inferred shape, then `op`
    fn push(&mut self, name: &str, op: Operator) -> Result<usize> {
        let shape = infer_shape(&op, &self.tensors).map_err(|e| match e {
            ExportError::ConversionError(msg) => {
                ExportError::ConversionError(format!("'{}': {}", name, msg))
            }
            other => other,
        })?;
        let output = self.activation(name, shape);
        self.operators.push(op);
        Ok(output)
    }

    /// Convolution with an OHWI filter
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        &mut self,
        name: &str,
        input: usize,
        filter: usize,
        bias: Option<usize>,
        stride: [usize; 2],
        padding: Padding,
        activation: Activation,
    ) -> Result<usize> {
        let output = self.tensors.len();
        self.push(
            name,
            Operator::Conv2d {
                input,
                filter,
                bias,
                output,
                stride,
                padding,
                activation,
            },
        )
    }

    pub fn max_pool2d(
        &mut self,
        name: &str,
        input: usize,
        filter: [usize; 2],
        stride: [usize; 2],
        padding: Padding,
    ) -> Result<usize> {
        let output = self.tensors.len();
        self.push(
            name,
            Operator::MaxPool2d {
                input,
                output,
                filter,
                stride,
                padding,
            },
        )
    }

    pub fn mean(&mut self, name: &str, input: usize, axes: &[usize], keep_dims: bool) -> Result<usize> {
        let output = self.tensors.len();
        self.push(
            name,
            Operator::Mean {
                input,
                output,
                axes: axes.to_vec(),
                keep_dims,
            },
        )
    }

    /// Flatten everything after the batch dimension
    pub fn flatten(&mut self, name: &str, input: usize) -> Result<usize> {
        let features: usize = self.shape(input)?.iter().skip(1).product();
        let output = self.tensors.len();
        self.push(
            name,
            Operator::Reshape {
                input,
                output,
                new_shape: vec![-1, features as i64],
            },
        )
    }

    /// Fully connected layer with `[out, in]` weights
    pub fn fully_connected(
        &mut self,
        name: &str,
        input: usize,
        weights: usize,
        bias: Option<usize>,
        activation: Activation,
    ) -> Result<usize> {
        let output = self.tensors.len();
        self.push(
            name,
            Operator::FullyConnected {
                input,
                weights,
                bias,
                output,
                activation,
            },
        )
    }

    pub fn softmax(&mut self, name: &str, input: usize, beta: f32) -> Result<usize> {
        let output = self.tensors.len();
        self.push(name, Operator::Softmax { input, output, beta })
    }

    pub fn relu(&mut self, name: &str, input: usize) -> Result<usize> {
        let output = self.tensors.len();
        self.push(name, Operator::Relu { input, output })
    }

    /// Standalone batch-norm; a select operator
    #[allow(clippy::too_many_arguments)]
    pub fn batch_norm(
        &mut self,
        name: &str,
        input: usize,
        scale: usize,
        offset: usize,
        mean: usize,
        variance: usize,
        epsilon: f32,
    ) -> Result<usize> {
        let output = self.tensors.len();
        self.push(
            name,
            Operator::BatchNorm {
                input,
                scale,
                offset,
                mean,
                variance,
                output,
                epsilon,
            },
        )
    }

    /// Finish the graph; buffers stay float32 until a policy is applied
    pub fn build(self, origin: ArtifactOrigin) -> MobileGraph {
        MobileGraph {
            origin,
            policy: None,
            tensors: self.tensors,
            buffers: self.buffers,
            operators: self.operators,
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

/// Output shape of `op` from the shapes of the tensors it reads
///
/// Rejects every operand combination the runtime could not execute.
pub fn infer_shape(op: &Operator, tensors: &[MobileTensor]) -> Result<Vec<usize>> {
    let kind = op.name();
    match op {
        Operator::Conv2d {
            input,
            filter,
            bias,
            stride,
            padding,
            ..
        } => {
            let [n, h, w, c] = fixed::<4>(tensors, *input, kind, "an NHWC input")?;
            let [out_c, kh, kw, in_c] = fixed::<4>(tensors, *filter, kind, "an OHWI filter")?;
            if in_c != c {
                return Err(ExportError::ConversionError(format!(
                    "{} filter expects {} channels, input has {}",
                    kind, in_c, c
                )));
            }
            check_vector(tensors, *bias, out_c, kind)?;
            Ok(vec![
                n,
                spatial_out(h, kh, stride[0], *padding)?,
                spatial_out(w, kw, stride[1], *padding)?,
                out_c,
            ])
        }
        Operator::MaxPool2d {
            input,
            filter,
            stride,
            padding,
            ..
        } => {
            let [n, h, w, c] = fixed::<4>(tensors, *input, kind, "an NHWC input")?;
            Ok(vec![
                n,
                spatial_out(h, filter[0], stride[0], *padding)?,
                spatial_out(w, filter[1], stride[1], *padding)?,
                c,
            ])
        }
        Operator::Mean {
            input,
            axes,
            keep_dims,
            ..
        } => {
            let shape = shape_of(tensors, *input)?;
            if axes.is_empty() || axes.iter().any(|&axis| axis == 0 || axis >= shape.len()) {
                return Err(ExportError::ConversionError(format!(
                    "{} axes {:?} invalid for shape {:?}",
                    kind, axes, shape
                )));
            }
            Ok(shape
                .iter()
                .enumerate()
                .filter_map(|(axis, &dim)| match (axes.contains(&axis), *keep_dims) {
                    (false, _) => Some(dim),
                    (true, true) => Some(1),
                    (true, false) => None,
                })
                .collect())
        }
        Operator::Reshape { input, new_shape, .. } => {
            let shape = shape_of(tensors, *input)?;
            let batch = shape.first().copied().unwrap_or(1);
            let features: usize = shape.iter().skip(1).product();
            match new_shape.as_slice() {
                [b, f] if (*b == -1 || *b == batch as i64) && *f == features as i64 => {
                    Ok(vec![batch, features])
                }
                _ => Err(ExportError::ConversionError(format!(
                    "{} to {:?} cannot flatten {:?}",
                    kind, new_shape, shape
                ))),
            }
        }
        Operator::FullyConnected {
            input, weights, bias, ..
        } => {
            let [batch, features] = fixed::<2>(tensors, *input, kind, "a 2-D input")?;
            let [units, in_features] = fixed::<2>(tensors, *weights, kind, "[out, in] weights")?;
            if in_features != features {
                return Err(ExportError::ConversionError(format!(
                    "{} weights expect {} features, input has {}",
                    kind, in_features, features
                )));
            }
            check_vector(tensors, *bias, units, kind)?;
            Ok(vec![batch, units])
        }
        Operator::Softmax { input, .. } => {
            let [batch, classes] = fixed::<2>(tensors, *input, kind, "a 2-D input")?;
            Ok(vec![batch, classes])
        }
        Operator::Relu { input, .. } => Ok(shape_of(tensors, *input)?.to_vec()),
        Operator::BatchNorm {
            input,
            scale,
            offset,
            mean,
            variance,
            ..
        } => {
            let [n, h, w, c] = fixed::<4>(tensors, *input, kind, "an NHWC input")?;
            for stat in [scale, offset, mean, variance] {
                check_vector(tensors, Some(*stat), c, kind)?;
            }
            Ok(vec![n, h, w, c])
        }
    }
}

fn shape_of(tensors: &[MobileTensor], index: usize) -> Result<&[usize]> {
    tensors
        .get(index)
        .map(|t| t.shape.as_slice())
        .ok_or_else(|| ExportError::ConversionError(format!("unknown tensor {}", index)))
}

fn fixed<const N: usize>(
    tensors: &[MobileTensor],
    index: usize,
    op: &str,
    what: &str,
) -> Result<[usize; N]> {
    let shape = shape_of(tensors, index)?;
    <[usize; N]>::try_from(shape).map_err(|_| {
        ExportError::ConversionError(format!(
            "{} expects {}, tensor {} is {:?}",
            op, what, index, shape
        ))
    })
}

/// A present bias or statistic must be a vector of `len` values
fn check_vector(tensors: &[MobileTensor], index: Option<usize>, len: usize, op: &str) -> Result<()> {
    if let Some(index) = index {
        let shape = shape_of(tensors, index)?;
        if shape != [len] {
            return Err(ExportError::ConversionError(format!(
                "{} vector {} is {:?}, expected [{}]",
                op, index, shape, len
            )));
        }
    }
    Ok(())
}

/// Output size of a windowed operator along one axis
pub fn spatial_out(size: usize, kernel: usize, stride: usize, padding: Padding) -> Result<usize> {
    if stride == 0 || kernel == 0 {
        return Err(ExportError::ConversionError("kernel and stride must be positive".to_string()));
    }
    match padding {
        Padding::Same => Ok(size.div_ceil(stride)),
        Padding::Valid if size >= kernel => Ok((size - kernel) / stride + 1),
        Padding::Valid => Err(ExportError::ConversionError(format!(
            "window {} does not fit into size {}",
            kernel, size
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_graph() -> MobileGraph {
        let mut builder = MobileGraphBuilder::new();
        let input = builder.add_input("input", &[1, 8, 8, 3]);
        let filter = builder.add_constant("conv/filter", &[4, 3, 3, 3], vec![0.1; 108]).unwrap();
        let bias = builder.add_constant("conv/bias", &[4], vec![0.0; 4]).unwrap();
        let x = builder
            .conv2d("conv", input, filter, Some(bias), [1, 1], Padding::Same, Activation::Relu)
            .unwrap();
        let x = builder.max_pool2d("pool", x, [2, 2], [2, 2], Padding::Valid).unwrap();
        let x = builder.mean("gap", x, &[1, 2], false).unwrap();
        let weights = builder.add_constant("dense/weights", &[2, 4], vec![0.5; 8]).unwrap();
        let x = builder.fully_connected("dense", x, weights, None, Activation::None).unwrap();
        let out = builder.softmax("probs", x, 1.0).unwrap();
        builder.mark_output(out);
        builder.build(ArtifactOrigin::Placeholder)
    }

    #[test]
    fn test_builder_infers_shapes() {
        let graph = tiny_graph();
        graph.check(SupportedOps::BuiltinsOnly).unwrap();

        let input = graph.input_tensor().unwrap();
        assert_eq!(input.shape, vec![1, 8, 8, 3]);
        assert_eq!(input.shape_signature, vec![-1, 8, 8, 3]);

        let output = graph.output_tensor().unwrap();
        assert_eq!(output.shape, vec![1, 2]);
        assert_eq!(output.shape_signature, vec![-1, 2]);

        let pool = graph.tensors.iter().find(|t| t.name == "pool").unwrap();
        assert_eq!(pool.shape, vec![1, 4, 4, 4]);
    }

    #[test]
    fn test_builder_rejects_channel_mismatch() {
        let mut builder = MobileGraphBuilder::new();
        let input = builder.add_input("input", &[1, 8, 8, 3]);
        let filter = builder.add_constant("filter", &[4, 3, 3, 1], vec![0.0; 36]).unwrap();
        let result = builder.conv2d("conv", input, filter, None, [1, 1], Padding::Same, Activation::None);
        assert!(matches!(result, Err(ExportError::ConversionError(_))));
    }

    #[test]
    fn test_select_ops_need_permission() {
        let mut builder = MobileGraphBuilder::new();
        let input = builder.add_input("input", &[1, 2, 2, 2]);
        let stats: Vec<usize> = ["scale", "offset", "mean", "var"]
            .iter()
            .map(|name| builder.add_constant(name, &[2], vec![1.0, 1.0]).unwrap())
            .collect();
        let out = builder
            .batch_norm("bn", input, stats[0], stats[1], stats[2], stats[3], 1e-5)
            .unwrap();
        builder.mark_output(out);
        let graph = builder.build(ArtifactOrigin::Placeholder);

        assert!(graph.check(SupportedOps::BuiltinsOnly).is_err());
        assert!(graph.check(SupportedOps::BuiltinsAndSelect).is_ok());
        assert_eq!(graph.summary().select_operators, 1);
    }

    #[test]
    fn test_check_catches_dangling_output() {
        let mut graph = tiny_graph();
        graph.outputs = vec![graph.tensors.len() + 3];
        assert!(graph.check(SupportedOps::BuiltinsOnly).is_err());
    }

    #[test]
    fn test_check_recomputes_operator_shapes() {
        // Filter reshaped with the same element count
        let mut graph = tiny_graph();
        let filter = graph.tensors.iter().position(|t| t.name == "conv/filter").unwrap();
        graph.tensors[filter].shape = vec![4, 3, 1, 9];
        assert!(graph.check(SupportedOps::BuiltinsOnly).is_err());

        // Activation declared with the wrong shape
        let mut graph = tiny_graph();
        let pool = graph.tensors.iter().position(|t| t.name == "pool").unwrap();
        graph.tensors[pool].shape = vec![1, 8, 8, 4];
        graph.tensors[pool].shape_signature = vec![-1, 8, 8, 4];
        assert!(graph.check(SupportedOps::BuiltinsOnly).is_err());

        let mut graph = tiny_graph();
        graph.tensors[0].shape = vec![1, 0, 8, 3];
        assert!(graph.check(SupportedOps::BuiltinsOnly).is_err());
    }

    #[test]
    fn test_builder_rejects_bad_bias_and_flatten_target() {
        let mut builder = MobileGraphBuilder::new();
        let input = builder.add_input("input", &[1, 4, 4, 2]);
        let filter = builder.add_constant("filter", &[3, 1, 1, 2], vec![0.0; 6]).unwrap();
        let bias = builder.add_constant("bias", &[2], vec![0.0; 2]).unwrap();
        let result = builder.conv2d("conv", input, filter, Some(bias), [1, 1], Padding::Same, Activation::None);
        assert!(matches!(result, Err(ExportError::ConversionError(msg)) if msg.contains("'conv'")));

        let flat = builder.flatten("flat", input).unwrap();
        assert_eq!(builder.shape(flat).unwrap(), &[1, 32]);
        assert!(builder.softmax("probs", input, 1.0).is_err());
    }

    #[test]
    fn test_dequantize_int8_per_channel() {
        let buffer = Buffer::Int8 {
            values: vec![127, -127, 64, 0],
            scales: vec![0.5, 2.0],
            axis: 0,
        };
        assert_eq!(buffer.dequantize().unwrap(), vec![63.5, -63.5, 128.0, 0.0]);
        assert_eq!(buffer.byte_size(), 4 + 8);

        let half = Buffer::F16(vec![f16::from_f32(1.5).to_bits()]);
        assert_eq!(half.dequantize().unwrap(), vec![1.5]);
    }

    #[test]
    fn test_write_and_read_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("assets").join("model.mgph");
        let graph = tiny_graph();

        let size = graph.write(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, size);
        assert_eq!(MobileGraph::read(&path).unwrap(), graph);

        // Same graph, same bytes
        assert_eq!(graph.to_bytes().unwrap(), fs::read(&path).unwrap());
    }

    #[test]
    fn test_spatial_out() {
        assert_eq!(spatial_out(224, 3, 1, Padding::Same).unwrap(), 224);
        assert_eq!(spatial_out(7, 2, 2, Padding::Same).unwrap(), 4);
        assert_eq!(spatial_out(7, 2, 2, Padding::Valid).unwrap(), 3);
        assert!(spatial_out(1, 2, 2, Padding::Valid).is_err());
    }
}
