//! Interchange-to-mobile lowering
//!
//! Walks the interchange nodes in order and emits the equivalent mobile
//! operators: NCHW values become NHWC, OIHW filters become OHWI, `Gemm`
//! weights are transposed to `[out, in]` and a `Relu` whose only producer is
//! a conv or dense layer is fused into it.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::ExportConfig;
use crate::graph::interchange::{Initializer, InterchangeGraph, Node, NodeKind};
use crate::graph::mobile::{Activation, ArtifactOrigin, MobileGraph, MobileGraphBuilder, Padding};
use crate::utils::error::{ExportError, Result};

/// Lower an interchange graph to an unoptimized mobile graph
pub fn lower(graph: &InterchangeGraph, config: &ExportConfig) -> Result<MobileGraph> {
    graph.check_topology()?;

    let [graph_input] = graph.inputs.as_slice() else {
        return Err(ExportError::ConversionError(format!(
            "expected exactly one graph input, found {}",
            graph.inputs.len()
        )));
    };
    let [graph_output] = graph.outputs.as_slice() else {
        return Err(ExportError::ConversionError(format!(
            "expected exactly one graph output, found {}",
            graph.outputs.len()
        )));
    };

    let dims: Vec<usize> = graph_input.dims.iter().map(|d| d.resolve(1)).collect();
    let [_, channels, height, width] = <[usize; 4]>::try_from(dims.as_slice()).map_err(|_| {
        ExportError::ConversionError(format!("input '{}' is not NCHW: {:?}", graph_input.name, dims))
    })?;

    let mut lowering = Lowering {
        graph,
        builder: MobileGraphBuilder::new(),
        values: HashMap::new(),
        fused: HashSet::new(),
    };
    let input = lowering
        .builder
        .add_input(&graph_input.name, &[1, height, width, channels]);
    lowering.values.insert(graph_input.name.clone(), input);

    for (index, node) in graph.nodes.iter().enumerate() {
        if lowering.fused.contains(&index) {
            continue;
        }
        lowering.lower_node(node)?;
    }

    let output = lowering.value(&graph_output.name)?;
    let expected = [1, graph_output.dims.get(1).map(|d| d.resolve(1)).unwrap_or(0)];
    let actual = lowering.builder.shape(output)?;
    if actual != expected || actual != config.mobile_output_shape() {
        return Err(ExportError::ConversionError(format!(
            "lowered output has shape {:?}, expected {:?}",
            actual,
            config.mobile_output_shape()
        )));
    }
    lowering.builder.mark_output(output);

    debug!("Lowered {} interchange nodes ({} fused)", graph.nodes.len(), lowering.fused.len());
    Ok(lowering.builder.build(ArtifactOrigin::Bridged {
        architecture: config.architecture.name.clone(),
    }))
}

struct Lowering<'a> {
    graph: &'a InterchangeGraph,
    builder: MobileGraphBuilder,
    /// Interchange value name to mobile tensor index
    values: HashMap<String, usize>,
    /// Interchange nodes absorbed into their producer
    fused: HashSet<usize>,
}

impl<'a> Lowering<'a> {
    fn value(&self, name: &str) -> Result<usize> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| ExportError::ConversionError(format!("value '{}' was not lowered", name)))
    }

    fn initializer(&self, node: &Node, position: usize) -> Result<&'a Initializer> {
        let name = node.inputs.get(position).ok_or_else(|| {
            ExportError::ConversionError(format!("'{}' is missing input {}", node.name, position))
        })?;
        self.graph.initializer(name).ok_or_else(|| {
            ExportError::ConversionError(format!(
                "'{}' input '{}' must be a constant",
                node.name, name
            ))
        })
    }

    fn optional_vector(&mut self, node: &Node, position: usize) -> Result<Option<usize>> {
        if node.inputs.len() <= position {
            return Ok(None);
        }
        let init = self.initializer(node, position)?;
        let (name, dims, data) = (init.name.clone(), init.dims.clone(), init.data.clone());
        Ok(Some(self.builder.add_constant(&name, &dims, data)?))
    }

    /// Relu node to fuse into `node`, if it is the sole reader of its output
    fn fusable_relu(&self, node: &Node) -> Option<(usize, String)> {
        let output = node.outputs.first()?;
        if self.graph.consumer_count(output) != 1 {
            return None;
        }
        self.graph.nodes.iter().enumerate().find_map(|(index, candidate)| {
            (matches!(candidate.kind, NodeKind::Relu) && candidate.inputs.first() == Some(output))
                .then(|| candidate.outputs.first().map(|out| (index, out.clone())))
                .flatten()
        })
    }

    /// Output name and fused activation for a conv or dense node
    fn fuse(&mut self, node: &Node) -> Result<(String, Activation)> {
        match self.fusable_relu(node) {
            Some((index, relu_output)) => {
                self.fused.insert(index);
                Ok((relu_output, Activation::Relu))
            }
            None => Ok((single_output(node)?, Activation::None)),
        }
    }

    fn lower_node(&mut self, node: &Node) -> Result<()> {
        let input = node
            .inputs
            .first()
            .ok_or_else(|| ExportError::ConversionError(format!("'{}' has no inputs", node.name)))?;
        let x = self.value(input)?;

        let (name, tensor) = match &node.kind {
            NodeKind::Conv {
                kernel_shape,
                strides,
                pads,
            } => {
                let weight = self.initializer(node, 1)?;
                let [out_c, in_c, kh, kw] = <[usize; 4]>::try_from(weight.dims.as_slice())
                    .map_err(|_| {
                        ExportError::ConversionError(format!("'{}' weight must be OIHW", node.name))
                    })?;
                if [kh, kw] != *kernel_shape {
                    return Err(ExportError::ConversionError(format!(
                        "'{}' declares kernel {:?} but weight is {}x{}",
                        node.name, kernel_shape, kh, kw
                    )));
                }
                let padding = conv_padding(&node.name, *kernel_shape, *pads)?;
                let filter_data = oihw_to_ohwi(&weight.data, [out_c, in_c, kh, kw]);
                let filter_name = weight.name.clone();
                let filter = self
                    .builder
                    .add_constant(&filter_name, &[out_c, kh, kw, in_c], filter_data)?;
                let bias = self.optional_vector(node, 2)?;
                let (name, activation) = self.fuse(node)?;
                let out = self
                    .builder
                    .conv2d(&name, x, filter, bias, *strides, padding, activation)?;
                (name, out)
            }
            NodeKind::BatchNormalization { epsilon } => {
                let mut stats = Vec::with_capacity(4);
                for position in 1..5 {
                    let stat = self
                        .optional_vector(node, position)?
                        .ok_or_else(|| {
                            ExportError::ConversionError(format!(
                                "'{}' is missing batch-norm statistics",
                                node.name
                            ))
                        })?;
                    stats.push(stat);
                }
                let name = single_output(node)?;
                let out = self.builder.batch_norm(
                    &name,
                    x,
                    stats[0],
                    stats[1],
                    stats[2],
                    stats[3],
                    *epsilon as f32,
                )?;
                (name, out)
            }
            NodeKind::Relu => {
                let name = single_output(node)?;
                let out = self.builder.relu(&name, x)?;
                (name, out)
            }
            NodeKind::MaxPool {
                kernel_shape,
                strides,
            } => {
                let name = single_output(node)?;
                let out = self
                    .builder
                    .max_pool2d(&name, x, *kernel_shape, *strides, Padding::Valid)?;
                (name, out)
            }
            NodeKind::GlobalAveragePool => {
                let name = single_output(node)?;
                let out = self.builder.mean(&name, x, &[1, 2], true)?;
                (name, out)
            }
            NodeKind::Flatten => {
                // NHWC and NCHW flatten agree only once the spatial size is 1x1
                let shape = self.builder.shape(x)?;
                if shape.len() == 4 && (shape[1] != 1 || shape[2] != 1) {
                    return Err(ExportError::ConversionError(format!(
                        "'{}' flattens a {:?} feature map; only 1x1 maps are supported",
                        node.name, shape
                    )));
                }
                let name = single_output(node)?;
                let out = self.builder.flatten(&name, x)?;
                (name, out)
            }
            NodeKind::Gemm => {
                let weight = self.initializer(node, 1)?;
                let [in_features, units] = <[usize; 2]>::try_from(weight.dims.as_slice())
                    .map_err(|_| {
                        ExportError::ConversionError(format!("'{}' weight must be 2-D", node.name))
                    })?;
                let weight_name = weight.name.clone();
                let transposed = transpose(&weight.data, in_features, units);
                let weights = self
                    .builder
                    .add_constant(&weight_name, &[units, in_features], transposed)?;
                let bias = self.optional_vector(node, 2)?;
                let (name, activation) = self.fuse(node)?;
                let out = self
                    .builder
                    .fully_connected(&name, x, weights, bias, activation)?;
                (name, out)
            }
            NodeKind::Softmax { axis } => {
                let rank = self.builder.shape(x)?.len() as i64;
                if rank != 2 || !(*axis == 1 || *axis == -1) {
                    return Err(ExportError::ConversionError(format!(
                        "'{}' softmax over axis {} of a rank-{} value is unsupported",
                        node.name, axis, rank
                    )));
                }
                let name = single_output(node)?;
                let out = self.builder.softmax(&name, x, 1.0)?;
                (name, out)
            }
        };

        self.values.insert(name, tensor);
        Ok(())
    }
}

fn single_output(node: &Node) -> Result<String> {
    match node.outputs.as_slice() {
        [output] => Ok(output.clone()),
        outputs => Err(ExportError::ConversionError(format!(
            "'{}' has {} outputs, expected 1",
            node.name,
            outputs.len()
        ))),
    }
}

/// Map symmetric interchange pads onto mobile padding
fn conv_padding(name: &str, kernel: [usize; 2], pads: [usize; 4]) -> Result<Padding> {
    let [top, left, bottom, right] = pads;
    if top != bottom || left != right {
        return Err(ExportError::ConversionError(format!(
            "'{}' has asymmetric pads {:?}",
            name, pads
        )));
    }
    if top == 0 && left == 0 {
        return Ok(Padding::Valid);
    }
    let same = kernel.iter().all(|k| k % 2 == 1) && top == (kernel[0] - 1) / 2 && left == (kernel[1] - 1) / 2;
    if same {
        Ok(Padding::Same)
    } else {
        Err(ExportError::ConversionError(format!(
            "'{}' pads {:?} are neither VALID nor SAME for kernel {:?}",
            name, pads, kernel
        )))
    }
}

/// Reorder an `[O, I, H, W]` filter as `[O, H, W, I]`
fn oihw_to_ohwi(data: &[f32], [o, i, h, w]: [usize; 4]) -> Vec<f32> {
    let mut out = vec![0.0; data.len()];
    for oc in 0..o {
        for ic in 0..i {
            for y in 0..h {
                for x in 0..w {
                    out[((oc * h + y) * w + x) * i + ic] = data[((oc * i + ic) * h + y) * w + x];
                }
            }
        }
    }
    out
}

/// Transpose a row-major `rows x cols` matrix
fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupportedOps;
    use crate::convert::optimize::apply_policy;
    use crate::graph::interchange::export_model;
    use crate::graph::mobile::Operator;
    use crate::model::cnn::{RiceDiseaseCnn, RiceDiseaseCnnConfig};
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

    fn exported(config: &ExportConfig) -> InterchangeGraph {
        let device = Default::default();
        let model =
            RiceDiseaseCnn::<TestBackend>::new(&RiceDiseaseCnnConfig::from_export(config), &device);
        export_model(&model, config, &device).unwrap()
    }

    #[test]
    fn test_lowered_io_contract() {
        let config = small_config();
        let mobile = lower(&exported(&config), &config).unwrap();

        let input = mobile.input_tensor().unwrap();
        assert_eq!(input.shape, vec![1, 16, 16, 3]);
        assert_eq!(input.shape_signature, vec![-1, 16, 16, 3]);
        assert_eq!(mobile.output_tensor().unwrap().shape, vec![1, 4]);
        assert_eq!(
            mobile.origin,
            ArtifactOrigin::Bridged {
                architecture: "rice_disease_cnn".to_string()
            }
        );
    }

    #[test]
    fn test_relu_is_fused() {
        let config = small_config();
        let mobile = lower(&exported(&config), &config).unwrap();

        assert!(mobile.operators.iter().all(|op| !matches!(op, Operator::Relu { .. })));
        let fused = mobile
            .operators
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    Operator::Conv2d { activation: Activation::Relu, .. }
                        | Operator::FullyConnected { activation: Activation::Relu, .. }
                )
            })
            .count();
        // Two conv blocks and the hidden dense layer
        assert_eq!(fused, 3);
        mobile.check(SupportedOps::BuiltinsOnly).unwrap();
    }

    #[test]
    fn test_unfolded_batch_norm_needs_select_ops() {
        let mut config = small_config();
        config.interchange.constant_folding = false;
        let interchange = exported(&config);

        let mut strict = lower(&interchange, &config).unwrap();
        let err = apply_policy(&mut strict, &config.optimization).unwrap_err();
        assert!(matches!(err, ExportError::ConversionError(_)));

        config.optimization.supported_ops = SupportedOps::BuiltinsAndSelect;
        let mut lenient = lower(&interchange, &config).unwrap();
        apply_policy(&mut lenient, &config.optimization).unwrap();
        assert_eq!(lenient.summary().select_operators, 2);
    }

    #[test]
    fn test_asymmetric_pads_are_rejected() {
        let config = small_config();
        let mut interchange = exported(&config);
        if let NodeKind::Conv { pads, .. } = &mut interchange.nodes[0].kind {
            *pads = [1, 1, 0, 0];
        }
        let err = lower(&interchange, &config).unwrap_err();
        assert!(err.to_string().contains("asymmetric"));
    }

    #[test]
    fn test_label_count_must_match_output() {
        let config = small_config();
        let interchange = exported(&config);

        let mut other = config.clone();
        other.labels = crate::labels::LabelSet::new(["Healthy", "Sick"]).unwrap();
        assert!(lower(&interchange, &other).is_err());
    }

    #[test]
    fn test_layout_helpers() {
        // O=1, I=2, H=1, W=2: values indexed [ic][x]
        let ohwi = oihw_to_ohwi(&[1.0, 2.0, 3.0, 4.0], [1, 2, 1, 2]);
        assert_eq!(ohwi, vec![1.0, 3.0, 2.0, 4.0]);

        let t = transpose(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        assert_eq!(t, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        assert_eq!(conv_padding("c", [3, 3], [1, 1, 1, 1]).unwrap(), Padding::Same);
        assert_eq!(conv_padding("c", [3, 3], [0, 0, 0, 0]).unwrap(), Padding::Valid);
        assert!(conv_padding("c", [3, 3], [2, 2, 2, 2]).is_err());
    }
}
