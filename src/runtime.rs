//! Minimal mobile-graph runtime
//!
//! Executes a [`MobileGraph`] with burn tensor ops so an artifact can be
//! smoke-tested on the host. Follows the usual interpreter lifecycle:
//! `allocate_tensors`, `set_input`, `invoke`, `output`.
//!
//! Feature maps are kept NCHW internally, which is what burn's convolution
//! and pooling expect; they are converted at the graph boundary only.

use std::collections::HashMap;
use std::path::Path;

use burn::{
    nn::pool::MaxPool2dConfig,
    tensor::{
        activation::{relu, softmax},
        backend::Backend,
        module::conv2d,
        ops::ConvOptions,
        Tensor, TensorData,
    },
};
use serde::Serialize;

use crate::config::SupportedOps;
use crate::graph::mobile::{Activation, MobileGraph, Operator, Padding};
use crate::utils::error::{ExportError, Result, ResultExt};

/// Name, position and declared shape of a graph input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorDetails {
    pub name: String,
    pub index: usize,
    pub shape: Vec<usize>,
    pub shape_signature: Vec<i64>,
}

/// Output values in the graph's NHWC / `[batch, classes]` layout
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone)]
enum Value<B: Backend> {
    /// NCHW feature map
    Map(Tensor<B, 4>),
    Matrix(Tensor<B, 2>),
}

#[derive(Debug, Clone)]
enum Constant<B: Backend> {
    /// OIHW conv filter
    Filter(Tensor<B, 4>),
    /// `[in, out]` dense weights
    Matrix(Tensor<B, 2>),
    Vector(Tensor<B, 1>),
}

fn runtime_error(msg: impl Into<String>) -> ExportError {
    ExportError::ArtifactValidationFailure(msg.into())
}

pub struct Interpreter<B: Backend> {
    graph: MobileGraph,
    device: B::Device,
    constants: HashMap<usize, Constant<B>>,
    values: HashMap<usize, Value<B>>,
    allocated: bool,
}

impl<B: Backend> Interpreter<B> {
    pub fn new(graph: MobileGraph, device: &B::Device) -> Self {
        Self {
            graph,
            device: device.clone(),
            constants: HashMap::new(),
            values: HashMap::new(),
            allocated: false,
        }
    }

    /// Load an artifact file
    pub fn from_file(path: &Path, device: &B::Device) -> Result<Self> {
        let graph = MobileGraph::read(path)?;
        Ok(Self::new(graph, device))
    }

    pub fn graph(&self) -> &MobileGraph {
        &self.graph
    }

    /// Check the graph, then dequantize every constant and lay it out for burn
    pub fn allocate_tensors(&mut self) -> Result<()> {
        self.graph
            .check(SupportedOps::BuiltinsAndSelect)
            .map_err(|e| runtime_error(format!("malformed graph: {}", e)))?;
        self.constants.clear();

        for op in &self.graph.operators {
            match op {
                Operator::Conv2d { filter, bias, .. } => {
                    let (data, shape) = constant_data(&self.graph, *filter)?;
                    let shape = <[usize; 4]>::try_from(shape.as_slice())
                        .map_err(|_| runtime_error(format!("filter {} is not OHWI", filter)))?;
                    let ohwi = Tensor::<B, 4>::from_data(TensorData::new(data, shape), &self.device);
                    self.constants
                        .insert(*filter, Constant::Filter(ohwi.permute([0, 3, 1, 2])));
                    if let Some(bias) = bias {
                        let vector = load_vector(&self.graph, *bias, &self.device)?;
                        self.constants.insert(*bias, vector);
                    }
                }
                Operator::FullyConnected { weights, bias, .. } => {
                    let (data, shape) = constant_data(&self.graph, *weights)?;
                    let shape = <[usize; 2]>::try_from(shape.as_slice())
                        .map_err(|_| runtime_error(format!("weights {} are not 2-D", weights)))?;
                    let out_in = Tensor::<B, 2>::from_data(TensorData::new(data, shape), &self.device);
                    self.constants
                        .insert(*weights, Constant::Matrix(out_in.transpose()));
                    if let Some(bias) = bias {
                        let vector = load_vector(&self.graph, *bias, &self.device)?;
                        self.constants.insert(*bias, vector);
                    }
                }
                Operator::BatchNorm {
                    scale,
                    offset,
                    mean,
                    variance,
                    ..
                } => {
                    for index in [*scale, *offset, *mean, *variance] {
                        let vector = load_vector(&self.graph, index, &self.device)?;
                        self.constants.insert(index, vector);
                    }
                }
                _ => {}
            }
        }

        self.allocated = true;
        Ok(())
    }

    fn details(&self, indices: &[usize]) -> Vec<TensorDetails> {
        indices
            .iter()
            .filter_map(|&index| {
                self.graph.tensors.get(index).map(|t| TensorDetails {
                    name: t.name.clone(),
                    index,
                    shape: t.shape.clone(),
                    shape_signature: t.shape_signature.clone(),
                })
            })
            .collect()
    }

    pub fn input_details(&self) -> Vec<TensorDetails> {
        self.details(&self.graph.inputs)
    }

    pub fn output_details(&self) -> Vec<TensorDetails> {
        self.details(&self.graph.outputs)
    }

    /// Set input `position` from NHWC data
    ///
    /// `shape` may differ from the declared shape only where the signature
    /// is dynamic.
    pub fn set_input(&mut self, position: usize, data: Vec<f32>, shape: &[usize]) -> Result<()> {
        let details = self
            .input_details()
            .into_iter()
            .nth(position)
            .ok_or_else(|| runtime_error(format!("graph has no input {}", position)))?;

        let compatible = shape.len() == details.shape_signature.len()
            && shape
                .iter()
                .zip(&details.shape_signature)
                .all(|(&given, &declared)| if declared < 0 { given > 0 } else { given as i64 == declared });
        if !compatible {
            return Err(runtime_error(format!(
                "input '{}' expects {:?}, got {:?}",
                details.name, details.shape_signature, shape
            )));
        }
        if data.len() != shape.iter().product::<usize>() {
            return Err(runtime_error(format!(
                "input '{}' of shape {:?} got {} values",
                details.name,
                shape,
                data.len()
            )));
        }

        let nhwc = <[usize; 4]>::try_from(shape)
            .map_err(|_| runtime_error(format!("input '{}' must be NHWC", details.name)))?;
        let tensor = Tensor::<B, 4>::from_data(TensorData::new(data, nhwc), &self.device);
        self.values
            .insert(details.index, Value::Map(tensor.permute([0, 3, 1, 2])));
        Ok(())
    }

    /// Run every operator in order
    pub fn invoke(&mut self) -> Result<()> {
        if !self.allocated {
            return Err(runtime_error("allocate_tensors must be called before invoke"));
        }
        for &input in &self.graph.inputs {
            if !self.values.contains_key(&input) {
                return Err(runtime_error(format!("input tensor {} was not set", input)));
            }
        }

        for op in &self.graph.operators {
            let value = execute(op, &self.constants, &self.values)?;
            self.values.insert(op.output(), value);
        }
        Ok(())
    }

    /// Read output `position` after [`Interpreter::invoke`]
    pub fn output(&self, position: usize) -> Result<OutputTensor> {
        let index = *self
            .graph
            .outputs
            .get(position)
            .ok_or_else(|| runtime_error(format!("graph has no output {}", position)))?;
        let value = self
            .values
            .get(&index)
            .ok_or_else(|| runtime_error("output requested before invoke"))?;

        let (shape, data) = match value.clone() {
            Value::Map(t) => {
                let t = t.permute([0, 2, 3, 1]);
                (t.dims().to_vec(), t.into_data())
            }
            Value::Matrix(t) => (t.dims().to_vec(), t.into_data()),
        };
        let data = data
            .convert::<f32>()
            .to_vec::<f32>()
            .validation_context("Failed to read output")?;

        Ok(OutputTensor { shape, data })
    }
}

fn constant_data(graph: &MobileGraph, index: usize) -> Result<(Vec<f32>, Vec<usize>)> {
    let tensor = graph
        .tensors
        .get(index)
        .ok_or_else(|| runtime_error(format!("constant {} does not exist", index)))?;
    let buffer = tensor
        .buffer
        .and_then(|b| graph.buffers.get(b))
        .ok_or_else(|| runtime_error(format!("tensor '{}' has no buffer", tensor.name)))?;
    let data = buffer
        .dequantize()
        .map_err(|e| runtime_error(format!("tensor '{}': {}", tensor.name, e)))?;
    Ok((data, tensor.shape.clone()))
}

fn load_vector<B: Backend>(graph: &MobileGraph, index: usize, device: &B::Device) -> Result<Constant<B>> {
    let (data, shape) = constant_data(graph, index)?;
    if shape.len() != 1 {
        return Err(runtime_error(format!("constant {} should be 1-D, is {:?}", index, shape)));
    }
    Ok(Constant::Vector(Tensor::from_data(
        TensorData::new(data, [shape[0]]),
        device,
    )))
}

fn value<B: Backend>(values: &HashMap<usize, Value<B>>, index: usize) -> Result<Value<B>> {
    values
        .get(&index)
        .cloned()
        .ok_or_else(|| runtime_error(format!("tensor {} read before it was written", index)))
}

fn feature_map<B: Backend>(values: &HashMap<usize, Value<B>>, index: usize) -> Result<Tensor<B, 4>> {
    match value(values, index)? {
        Value::Map(t) => Ok(t),
        Value::Matrix(_) => Err(runtime_error(format!("tensor {} should be 4-D", index))),
    }
}

fn matrix<B: Backend>(values: &HashMap<usize, Value<B>>, index: usize) -> Result<Tensor<B, 2>> {
    match value(values, index)? {
        Value::Matrix(t) => Ok(t),
        Value::Map(_) => Err(runtime_error(format!("tensor {} should be 2-D", index))),
    }
}

fn vector<B: Backend>(constants: &HashMap<usize, Constant<B>>, index: usize) -> Result<Tensor<B, 1>> {
    match constants.get(&index) {
        Some(Constant::Vector(t)) => Ok(t.clone()),
        _ => Err(runtime_error(format!("constant {} is not an allocated vector", index))),
    }
}

/// Symmetric padding for SAME windows; odd totals cannot be expressed
fn same_padding(size: usize, kernel: usize, stride: usize) -> Result<usize> {
    let out = size.div_ceil(stride);
    let total = (out.saturating_sub(1) * stride + kernel).saturating_sub(size);
    if total % 2 == 1 {
        return Err(runtime_error(format!(
            "SAME padding of {} for kernel {} stride {} is asymmetric",
            size, kernel, stride
        )));
    }
    Ok(total / 2)
}

fn activate<B: Backend, const D: usize>(x: Tensor<B, D>, activation: Activation) -> Tensor<B, D> {
    match activation {
        Activation::None => x,
        Activation::Relu => relu(x),
    }
}

fn execute<B: Backend>(
    op: &Operator,
    constants: &HashMap<usize, Constant<B>>,
    values: &HashMap<usize, Value<B>>,
) -> Result<Value<B>> {
    match op {
        Operator::Conv2d {
            input,
            filter,
            bias,
            stride,
            padding,
            activation,
            ..
        } => {
            let x = feature_map(values, *input)?;
            let weight = match constants.get(filter) {
                Some(Constant::Filter(w)) => w.clone(),
                _ => return Err(runtime_error(format!("filter {} is not allocated", filter))),
            };
            let bias = bias.map(|b| vector(constants, b)).transpose()?;

            let [_, _, h, w] = x.dims();
            let [_, _, kh, kw] = weight.dims();
            let pads = match padding {
                Padding::Valid => [0, 0],
                Padding::Same => [same_padding(h, kh, stride[0])?, same_padding(w, kw, stride[1])?],
            };

            let y = conv2d(x, weight, bias, ConvOptions::new(*stride, pads, [1, 1], 1));
            Ok(Value::Map(activate(y, *activation)))
        }
        Operator::MaxPool2d {
            input,
            filter,
            stride,
            padding,
            ..
        } => {
            let x = feature_map(values, *input)?;
            let [_, _, h, w] = x.dims();
            if *padding == Padding::Same
                && (same_padding(h, filter[0], stride[0])? != 0 || same_padding(w, filter[1], stride[1])? != 0)
            {
                return Err(runtime_error("padded max pooling is not supported"));
            }
            let pool = MaxPool2dConfig::new(*filter).with_strides(*stride).init();
            Ok(Value::Map(pool.forward(x)))
        }
        Operator::Mean {
            input,
            axes,
            keep_dims,
            ..
        } => {
            let mut x = feature_map(values, *input)?;
            let mut sorted = axes.clone();
            sorted.sort_unstable();
            for &axis in &sorted {
                // NHWC axis to NCHW axis
                let dim = match axis {
                    1 => 2,
                    2 => 3,
                    3 => 1,
                    _ => return Err(runtime_error(format!("MEAN over axis {} is unsupported", axis))),
                };
                x = x.mean_dim(dim);
            }
            if *keep_dims {
                Ok(Value::Map(x))
            } else if sorted == [1, 2] {
                let [n, c, _, _] = x.dims();
                Ok(Value::Matrix(x.reshape([n, c])))
            } else {
                Err(runtime_error(format!("MEAN over {:?} without keep_dims is unsupported", axes)))
            }
        }
        Operator::Reshape { input, new_shape, .. } => {
            let (n, flat) = match value(values, *input)? {
                Value::Map(t) => {
                    let [n, c, h, w] = t.dims();
                    (n, t.permute([0, 2, 3, 1]).reshape([n, h * w * c]))
                }
                Value::Matrix(t) => (t.dims()[0], t),
            };
            let features = flat.dims()[1];
            match new_shape.as_slice() {
                [batch, width] if (*batch == -1 || *batch == n as i64) && *width == features as i64 => {
                    Ok(Value::Matrix(flat))
                }
                _ => Err(runtime_error(format!(
                    "RESHAPE to {:?} is unsupported for {} features",
                    new_shape, features
                ))),
            }
        }
        Operator::FullyConnected {
            input,
            weights,
            bias,
            activation,
            ..
        } => {
            let x = matrix(values, *input)?;
            let w = match constants.get(weights) {
                Some(Constant::Matrix(w)) => w.clone(),
                _ => return Err(runtime_error(format!("weights {} are not allocated", weights))),
            };
            let mut y = x.matmul(w);
            if let Some(bias) = bias {
                y = y + vector(constants, *bias)?.unsqueeze::<2>();
            }
            Ok(Value::Matrix(activate(y, *activation)))
        }
        Operator::Softmax { input, beta, .. } => {
            let x = matrix(values, *input)?;
            Ok(Value::Matrix(softmax(x.mul_scalar(*beta), 1)))
        }
        Operator::Relu { input, .. } => Ok(match value(values, *input)? {
            Value::Map(t) => Value::Map(relu(t)),
            Value::Matrix(t) => Value::Matrix(relu(t)),
        }),
        Operator::BatchNorm {
            input,
            scale,
            offset,
            mean,
            variance,
            epsilon,
            ..
        } => {
            let x = feature_map(values, *input)?;
            let channels = x.dims()[1];
            let as_map = |t: Tensor<B, 1>| t.reshape([1, channels, 1, 1]);

            let mean = as_map(vector(constants, *mean)?);
            let std = as_map(vector(constants, *variance)?.add_scalar(*epsilon).sqrt());
            let scale = as_map(vector(constants, *scale)?);
            let offset = as_map(vector(constants, *offset)?);
            Ok(Value::Map((x - mean) / std * scale + offset))
        }
    }
}
