//! Interchange graph
//!
//! An ONNX-shaped description of the source model: named value infos, nodes
//! in execution order and named float initializers. Layout is NCHW, conv
//! filters are OIHW and `Gemm` computes `Y = X·W + b` with `W` as `[in, out]`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ExportConfig;
use crate::graph::{decode_framed, encode_framed};
use crate::model::cnn::{RiceDiseaseCnn, KERNEL_SIZE};
use crate::utils::error::{ExportError, Result, ResultExt};

pub const INTERCHANGE_MAGIC: &[u8; 4] = b"IXG1";
pub const INTERCHANGE_VERSION: u32 = 1;

/// Name of the batch dimension on graph inputs and outputs
pub const BATCH_DIM: &str = "batch_size";

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";

const PRODUCER: &str = "rice_model_export";

/// One dimension of a value info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    Fixed(usize),
    Dynamic(String),
}

impl Dim {
    /// Size to use when the dimension has to be concrete
    pub fn resolve(&self, dynamic: usize) -> usize {
        match self {
            Dim::Fixed(size) => *size,
            Dim::Dynamic(_) => dynamic,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dim::Dynamic(_))
    }
}

/// Named graph input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub dims: Vec<Dim>,
}

impl ValueInfo {
    /// Value info whose first dimension is the dynamic batch
    pub fn batched(name: &str, fixed: &[usize]) -> Self {
        let mut dims = vec![Dim::Dynamic(BATCH_DIM.to_string())];
        dims.extend(fixed.iter().map(|&d| Dim::Fixed(d)));
        Self {
            name: name.to_string(),
            dims,
        }
    }
}

/// Named constant tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

/// Operator type and attributes of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Inputs: X, W (OIHW), optional B. Pads are `[top, left, bottom, right]`.
    Conv {
        kernel_shape: [usize; 2],
        strides: [usize; 2],
        pads: [usize; 4],
    },
    /// Inputs: X, scale, bias, mean, var
    BatchNormalization { epsilon: f64 },
    Relu,
    MaxPool {
        kernel_shape: [usize; 2],
        strides: [usize; 2],
    },
    GlobalAveragePool,
    Flatten,
    /// Inputs: X, W (`[in, out]`), optional B
    Gemm,
    Softmax { axis: i64 },
}

impl NodeKind {
    pub fn op_type(&self) -> &'static str {
        match self {
            NodeKind::Conv { .. } => "Conv",
            NodeKind::BatchNormalization { .. } => "BatchNormalization",
            NodeKind::Relu => "Relu",
            NodeKind::MaxPool { .. } => "MaxPool",
            NodeKind::GlobalAveragePool => "GlobalAveragePool",
            NodeKind::Flatten => "Flatten",
            NodeKind::Gemm => "Gemm",
            NodeKind::Softmax { .. } => "Softmax",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl Node {
    fn new(name: impl Into<String>, kind: NodeKind, inputs: Vec<String>) -> Self {
        let name = name.into();
        Self {
            outputs: vec![name.clone()],
            name,
            kind,
            inputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterchangeGraph {
    pub producer: String,
    pub opset_version: u32,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
}

impl InterchangeGraph {
    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|init| init.name == name)
    }

    fn initializer_mut(&mut self, name: &str) -> Result<&mut Initializer> {
        self.initializers
            .iter_mut()
            .find(|init| init.name == name)
            .ok_or_else(|| ExportError::ConversionError(format!("missing initializer '{}'", name)))
    }

    fn initializer_data(&self, name: &str) -> Result<Vec<f32>> {
        self.initializer(name)
            .map(|init| init.data.clone())
            .ok_or_else(|| ExportError::ConversionError(format!("missing initializer '{}'", name)))
    }

    /// Number of node inputs and graph outputs reading `value`
    pub fn consumer_count(&self, value: &str) -> usize {
        let node_reads = self
            .nodes
            .iter()
            .flat_map(|node| node.inputs.iter())
            .filter(|input| *input == value)
            .count();
        let graph_reads = self.outputs.iter().filter(|out| out.name == value).count();
        node_reads + graph_reads
    }

    /// Index of the node producing `value`
    pub fn producer_of(&self, value: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.outputs.iter().any(|out| out == value))
    }

    /// Check that every value is defined before it is read
    pub fn check_topology(&self) -> Result<()> {
        let mut defined: HashSet<&str> = self.inputs.iter().map(|v| v.name.as_str()).collect();
        defined.extend(self.initializers.iter().map(|init| init.name.as_str()));

        for node in &self.nodes {
            for input in &node.inputs {
                if !defined.contains(input.as_str()) {
                    return Err(ExportError::ConversionError(format!(
                        "node '{}' reads undefined value '{}'",
                        node.name, input
                    )));
                }
            }
            for output in &node.outputs {
                if !defined.insert(output.as_str()) {
                    return Err(ExportError::ConversionError(format!(
                        "value '{}' is defined twice",
                        output
                    )));
                }
            }
        }

        for output in &self.outputs {
            if !defined.contains(output.name.as_str()) {
                return Err(ExportError::ConversionError(format!(
                    "graph output '{}' is never produced",
                    output.name
                )));
            }
        }

        for init in &self.initializers {
            let expected: usize = init.dims.iter().product();
            if expected != init.data.len() {
                return Err(ExportError::ConversionError(format!(
                    "initializer '{}' declares {:?} but holds {} values",
                    init.name,
                    init.dims,
                    init.data.len()
                )));
            }
        }

        Ok(())
    }

    /// Drop initializers no node reads
    fn prune_initializers(&mut self) {
        let used: HashSet<String> = self
            .nodes
            .iter()
            .flat_map(|node| node.inputs.iter().cloned())
            .collect();
        self.initializers.retain(|init| used.contains(&init.name));
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_framed(INTERCHANGE_MAGIC, INTERCHANGE_VERSION, self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_framed(INTERCHANGE_MAGIC, INTERCHANGE_VERSION, bytes)
    }

    /// Write the encoded graph, returning its size in bytes
    pub fn write(&self, path: &Path) -> Result<usize> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, &bytes)?;
        info!("Interchange graph saved to: {:?}", path);
        Ok(bytes.len())
    }
}

/// Export the loaded source model as an interchange graph
///
/// A zero input of the configured dummy shape is traced through the model
/// first; the export is refused if it does not produce `[1, classes]`.
pub fn export_model<B: Backend>(
    model: &RiceDiseaseCnn<B>,
    config: &ExportConfig,
    device: &B::Device,
) -> Result<InterchangeGraph> {
    let dummy_shape = config.dummy_input_shape();
    let num_classes = config.num_classes();

    let traced = model.forward(Tensor::<B, 4>::zeros(dummy_shape, device));
    if traced.dims() != [1, num_classes] {
        return Err(ExportError::ConversionError(format!(
            "trace produced shape {:?}, expected [1, {}]",
            traced.dims(),
            num_classes
        )));
    }

    let [_, channels, height, width] = dummy_shape;
    let mut nodes = Vec::new();
    let mut initializers = Vec::new();
    let mut current = INPUT_NAME.to_string();
    let same_pad = (KERNEL_SIZE - 1) / 2;

    for (index, block) in model.blocks.iter().enumerate() {
        let prefix = format!("blocks.{}", index);

        let weight_name = format!("{}.conv.weight", prefix);
        initializers.push(initializer(&weight_name, block.conv.weight.val())?);
        let mut conv_inputs = vec![current.clone(), weight_name];
        if let Some(bias) = &block.conv.bias {
            let bias_name = format!("{}.conv.bias", prefix);
            initializers.push(initializer(&bias_name, bias.val())?);
            conv_inputs.push(bias_name);
        }
        let conv = Node::new(
            format!("{}.conv", prefix),
            NodeKind::Conv {
                kernel_shape: [KERNEL_SIZE, KERNEL_SIZE],
                strides: [1, 1],
                pads: [same_pad; 4],
            },
            conv_inputs,
        );
        current = conv.outputs[0].clone();
        nodes.push(conv);

        let bn_names: Vec<String> = ["gamma", "beta", "running_mean", "running_var"]
            .iter()
            .map(|stat| format!("{}.bn.{}", prefix, stat))
            .collect();
        initializers.push(initializer(&bn_names[0], block.bn.gamma.val())?);
        initializers.push(initializer(&bn_names[1], block.bn.beta.val())?);
        initializers.push(initializer(&bn_names[2], block.bn.running_mean.value())?);
        initializers.push(initializer(&bn_names[3], block.bn.running_var.value())?);
        let mut bn_inputs = vec![current.clone()];
        bn_inputs.extend(bn_names);
        let bn = Node::new(
            format!("{}.bn", prefix),
            NodeKind::BatchNormalization {
                epsilon: crate::model::cnn::BATCH_NORM_EPSILON,
            },
            bn_inputs,
        );
        current = bn.outputs[0].clone();
        nodes.push(bn);

        let relu = Node::new(format!("{}.relu", prefix), NodeKind::Relu, vec![current.clone()]);
        current = relu.outputs[0].clone();
        nodes.push(relu);

        let pool = Node::new(
            format!("{}.pool", prefix),
            NodeKind::MaxPool {
                kernel_shape: [2, 2],
                strides: [2, 2],
            },
            vec![current.clone()],
        );
        current = pool.outputs[0].clone();
        nodes.push(pool);
    }

    let gap = Node::new("global_pool", NodeKind::GlobalAveragePool, vec![current.clone()]);
    current = gap.outputs[0].clone();
    nodes.push(gap);

    let flatten = Node::new("flatten", NodeKind::Flatten, vec![current.clone()]);
    current = flatten.outputs[0].clone();
    nodes.push(flatten);

    for (name, linear) in [("fc1", &model.fc1), ("fc2", &model.fc2)] {
        let weight_name = format!("{}.weight", name);
        initializers.push(initializer(&weight_name, linear.weight.val())?);
        let mut inputs = vec![current.clone(), weight_name];
        if let Some(bias) = &linear.bias {
            let bias_name = format!("{}.bias", name);
            initializers.push(initializer(&bias_name, bias.val())?);
            inputs.push(bias_name);
        }
        let gemm = Node::new(name, NodeKind::Gemm, inputs);
        current = gemm.outputs[0].clone();
        nodes.push(gemm);

        // Dropout sits between the two layers but is inert in evaluation export
        if name == "fc1" {
            let relu = Node::new("fc1.relu", NodeKind::Relu, vec![current.clone()]);
            current = relu.outputs[0].clone();
            nodes.push(relu);
        }
    }

    if config.interchange.append_softmax {
        let softmax = Node::new("softmax", NodeKind::Softmax { axis: 1 }, vec![current]);
        nodes.push(softmax);
    }

    if let Some(last) = nodes.last_mut() {
        last.outputs[0] = OUTPUT_NAME.to_string();
    }

    let mut graph = InterchangeGraph {
        producer: PRODUCER.to_string(),
        opset_version: config.interchange.opset_version,
        inputs: vec![ValueInfo::batched(INPUT_NAME, &[channels, height, width])],
        outputs: vec![ValueInfo::batched(OUTPUT_NAME, &[num_classes])],
        nodes,
        initializers,
    };

    if config.interchange.constant_folding {
        let folded = fold_batch_norms(&mut graph)?;
        debug!("Constant folding merged {} batch-norm nodes", folded);
    }

    graph.check_topology()?;
    info!(
        "Exported interchange graph: {} nodes, {} initializers, opset {}",
        graph.nodes.len(),
        graph.initializers.len(),
        graph.opset_version
    );
    Ok(graph)
}

fn initializer<B: Backend, const D: usize>(name: &str, tensor: Tensor<B, D>) -> Result<Initializer> {
    let dims = tensor.dims().to_vec();
    let data = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .conversion_context(&format!("Failed to read tensor '{}'", name))?;

    Ok(Initializer {
        name: name.to_string(),
        dims,
        data,
    })
}

/// Fold every batch-norm that directly follows a single-consumer conv into
/// that conv's weights and bias. Returns the number of folded nodes.
pub fn fold_batch_norms(graph: &mut InterchangeGraph) -> Result<usize> {
    let mut folded = 0;
    while let Some((conv_idx, bn_idx)) = find_foldable(graph) {
        fold_pair(graph, conv_idx, bn_idx)?;
        folded += 1;
    }
    graph.prune_initializers();
    Ok(folded)
}

fn find_foldable(graph: &InterchangeGraph) -> Option<(usize, usize)> {
    graph.nodes.iter().enumerate().find_map(|(bn_idx, node)| {
        if !matches!(node.kind, NodeKind::BatchNormalization { .. }) {
            return None;
        }
        let source = node.inputs.first()?;
        let conv_idx = graph.producer_of(source)?;
        let is_conv = matches!(graph.nodes[conv_idx].kind, NodeKind::Conv { .. });
        (is_conv && graph.consumer_count(source) == 1).then_some((conv_idx, bn_idx))
    })
}

fn fold_pair(graph: &mut InterchangeGraph, conv_idx: usize, bn_idx: usize) -> Result<()> {
    let bn = graph.nodes[bn_idx].clone();
    let NodeKind::BatchNormalization { epsilon } = bn.kind else {
        return Err(ExportError::ConversionError(format!("'{}' is not a batch-norm", bn.name)));
    };
    if bn.inputs.len() != 5 {
        return Err(ExportError::ConversionError(format!(
            "batch-norm '{}' has {} inputs, expected 5",
            bn.name,
            bn.inputs.len()
        )));
    }

    let gamma = graph.initializer_data(&bn.inputs[1])?;
    let beta = graph.initializer_data(&bn.inputs[2])?;
    let mean = graph.initializer_data(&bn.inputs[3])?;
    let var = graph.initializer_data(&bn.inputs[4])?;
    let channels = gamma.len();
    if [beta.len(), mean.len(), var.len()].iter().any(|&len| len != channels) {
        return Err(ExportError::ConversionError(format!(
            "batch-norm '{}' statistics disagree in length",
            bn.name
        )));
    }

    let scale: Vec<f32> = gamma
        .iter()
        .zip(var.iter())
        .map(|(g, v)| g / (v + epsilon as f32).sqrt())
        .collect();

    let conv_name = graph.nodes[conv_idx].name.clone();
    let conv_inputs = graph.nodes[conv_idx].inputs.clone();
    let weight_name = conv_inputs.get(1).cloned().ok_or_else(|| {
        ExportError::ConversionError(format!("conv '{}' has no weight input", conv_name))
    })?;

    let weight = graph.initializer_mut(&weight_name)?;
    if weight.dims.first() != Some(&channels) || weight.data.len() % channels != 0 {
        return Err(ExportError::ConversionError(format!(
            "conv '{}' weight {:?} does not match {} batch-norm channels",
            conv_name, weight.dims, channels
        )));
    }
    let per_channel = weight.data.len() / channels;
    for (i, value) in weight.data.iter_mut().enumerate() {
        *value *= scale[i / per_channel];
    }

    let bias_name = match conv_inputs.get(2) {
        Some(name) => name.clone(),
        None => {
            let name = format!("{}.folded_bias", conv_name);
            graph.initializers.push(Initializer {
                name: name.clone(),
                dims: vec![channels],
                data: vec![0.0; channels],
            });
            graph.nodes[conv_idx].inputs.push(name.clone());
            name
        }
    };
    let bias = graph.initializer_mut(&bias_name)?;
    if bias.data.len() != channels {
        return Err(ExportError::ConversionError(format!(
            "conv '{}' bias has {} values, expected {}",
            conv_name,
            bias.data.len(),
            channels
        )));
    }
    for c in 0..channels {
        bias.data[c] = (bias.data[c] - mean[c]) * scale[c] + beta[c];
    }

    graph.nodes[conv_idx].outputs[0] = bn.outputs[0].clone();
    graph.nodes.remove(bn_idx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cnn::RiceDiseaseCnnConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn small_config() -> ExportConfig {
        let mut config = ExportConfig::default();
        config.input.image_size = 16;
        config.architecture.num_blocks = 2;
        config.architecture.base_filters = 4;
        config.architecture.hidden_units = 8;
        config
    }

    fn conv_bn_graph() -> InterchangeGraph {
        InterchangeGraph {
            producer: PRODUCER.to_string(),
            opset_version: 11,
            inputs: vec![ValueInfo::batched(INPUT_NAME, &[1, 1, 1])],
            outputs: vec![ValueInfo::batched(OUTPUT_NAME, &[2, 1, 1])],
            nodes: vec![
                Node::new(
                    "conv",
                    NodeKind::Conv {
                        kernel_shape: [1, 1],
                        strides: [1, 1],
                        pads: [0; 4],
                    },
                    vec![INPUT_NAME.to_string(), "w".to_string()],
                ),
                Node {
                    name: "bn".to_string(),
                    kind: NodeKind::BatchNormalization { epsilon: 0.0 },
                    inputs: ["conv", "gamma", "beta", "mean", "var"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    outputs: vec![OUTPUT_NAME.to_string()],
                },
            ],
            initializers: vec![
                Initializer { name: "w".into(), dims: vec![2, 1, 1, 1], data: vec![1.0, 2.0] },
                Initializer { name: "gamma".into(), dims: vec![2], data: vec![2.0, 1.0] },
                Initializer { name: "beta".into(), dims: vec![2], data: vec![1.0, 0.0] },
                Initializer { name: "mean".into(), dims: vec![2], data: vec![0.5, 0.0] },
                Initializer { name: "var".into(), dims: vec![2], data: vec![4.0, 1.0] },
            ],
        }
    }

    #[test]
    fn test_fold_batch_norm_into_conv() {
        let mut graph = conv_bn_graph();
        assert_eq!(fold_batch_norms(&mut graph).unwrap(), 1);

        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].outputs[0], OUTPUT_NAME);
        graph.check_topology().unwrap();

        // scale = gamma / sqrt(var) = [1.0, 1.0]
        let weight = graph.initializer("w").unwrap();
        assert_eq!(weight.data, vec![1.0, 2.0]);
        // bias = (0 - mean) * scale + beta
        let bias = graph.initializer("conv.folded_bias").unwrap();
        assert_eq!(bias.data, vec![0.5, 0.0]);
        assert!(graph.initializer("gamma").is_none());
    }

    #[test]
    fn test_no_fold_when_conv_output_is_shared() {
        let mut graph = conv_bn_graph();
        graph.outputs.push(ValueInfo::batched("conv", &[2, 1, 1]));

        assert_eq!(fold_batch_norms(&mut graph).unwrap(), 0);
        assert_eq!(graph.nodes.len(), 2);
    }

    #[test]
    fn test_topology_detects_undefined_values() {
        let mut graph = conv_bn_graph();
        graph.nodes[1].inputs[1] = "missing".to_string();
        assert!(matches!(
            graph.check_topology(),
            Err(ExportError::ConversionError(_))
        ));
    }

    #[test]
    fn test_export_declares_dynamic_batch() {
        let config = small_config();
        let device = Default::default();
        let model = RiceDiseaseCnn::<TestBackend>::new(&RiceDiseaseCnnConfig::from_export(&config), &device);

        let graph = export_model(&model, &config, &device).unwrap();

        let input = &graph.inputs[0];
        assert_eq!(input.name, INPUT_NAME);
        assert!(input.dims[0].is_dynamic());
        assert_eq!(input.dims[1..], [Dim::Fixed(3), Dim::Fixed(16), Dim::Fixed(16)]);

        let output = &graph.outputs[0];
        assert!(output.dims[0].is_dynamic());
        assert_eq!(output.dims[1], Dim::Fixed(4));

        // Batch-norms are folded away, dropout never appears
        assert!(graph
            .nodes
            .iter()
            .all(|n| !matches!(n.kind, NodeKind::BatchNormalization { .. })));
        assert!(matches!(graph.nodes.last().unwrap().kind, NodeKind::Softmax { axis: 1 }));
        assert_eq!(graph.opset_version, 11);
    }

    #[test]
    fn test_export_without_folding_keeps_batch_norm() {
        let mut config = small_config();
        config.interchange.constant_folding = false;
        config.interchange.append_softmax = false;
        let device = Default::default();
        let model = RiceDiseaseCnn::<TestBackend>::new(&RiceDiseaseCnnConfig::from_export(&config), &device);

        let graph = export_model(&model, &config, &device).unwrap();
        let bn_count = graph
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::BatchNormalization { .. }))
            .count();
        assert_eq!(bn_count, 2);
        assert!(matches!(graph.nodes.last().unwrap().kind, NodeKind::Gemm));
    }

    #[test]
    fn test_bytes_survive_encoding() {
        let graph = conv_bn_graph();
        let decoded = InterchangeGraph::from_bytes(&graph.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, graph);
    }
}
