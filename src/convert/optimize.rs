//! Artifact optimization
//!
//! Applies an [`OptimizationPolicy`] to a finished mobile graph. The bridged
//! and placeholder artifacts both pass through here so they are stored the
//! same way.
//!
//! - float16 precision stores every constant buffer as half floats
//! - float32 with default quantization stores large conv/dense weights as
//!   symmetric int8 with one scale per output channel; biases stay float32
//! - float32 without quantization leaves the graph untouched

use std::collections::BTreeSet;

use half::f16;
use tracing::debug;

use crate::config::{OptimizationPolicy, WeightPrecision};
use crate::graph::mobile::{Buffer, MobileGraph};
use crate::utils::error::{ExportError, Result};

/// Weight tensors smaller than this stay float32
pub const MIN_QUANTIZE_ELEMENTS: usize = 1024;

const INT8_MAX: f32 = 127.0;

/// Check operator-set compliance and re-encode the buffers per `policy`
pub fn apply_policy(graph: &mut MobileGraph, policy: &OptimizationPolicy) -> Result<()> {
    if graph.policy.is_some() {
        return Err(ExportError::ConversionError(
            "optimization policy was already applied".to_string(),
        ));
    }
    graph.check(policy.supported_ops)?;

    match (policy.weight_precision, policy.default_quantization) {
        (WeightPrecision::Float16, _) => {
            for buffer in graph.buffers.iter_mut() {
                if let Buffer::F32(data) = buffer {
                    *buffer = Buffer::F16(data.iter().map(|&v| f16::from_f32(v).to_bits()).collect());
                }
            }
            debug!("Stored {} buffers as float16", graph.buffers.len());
        }
        (WeightPrecision::Float32, true) => {
            let quantized = quantize_weights(graph)?;
            debug!("Quantized {} weight buffers to int8", quantized);
        }
        (WeightPrecision::Float32, false) => {}
    }

    graph.policy = Some(*policy);
    Ok(())
}

fn quantize_weights(graph: &mut MobileGraph) -> Result<usize> {
    let targets: BTreeSet<(usize, usize)> = graph
        .operators
        .iter()
        .filter_map(|op| op.quantizable_weight())
        .filter_map(|tensor| {
            let t = graph.tensors.get(tensor)?;
            let channels = *t.shape.first()?;
            (t.element_count() >= MIN_QUANTIZE_ELEMENTS)
                .then_some(t.buffer)
                .flatten()
                .map(|buffer| (buffer, channels))
        })
        .collect();

    let mut count = 0;
    for (buffer, channels) in targets {
        let slot = graph.buffers.get_mut(buffer).ok_or_else(|| {
            ExportError::ConversionError(format!("weight buffer {} is missing", buffer))
        })?;
        if let Buffer::F32(data) = slot {
            *slot = quantize_per_channel(data, channels)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Symmetric int8 quantization with one scale per slice along axis 0
pub fn quantize_per_channel(data: &[f32], channels: usize) -> Result<Buffer> {
    if channels == 0 || data.len() % channels != 0 {
        return Err(ExportError::ConversionError(format!(
            "{} values cannot be split into {} channels",
            data.len(),
            channels
        )));
    }

    let run = data.len() / channels;
    let mut values = Vec::with_capacity(data.len());
    let mut scales = Vec::with_capacity(channels);

    for slice in data.chunks(run) {
        let max_abs = slice.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        // An all-zero channel still needs a usable scale
        let scale = if max_abs > 0.0 { max_abs / INT8_MAX } else { 1.0 };
        values.extend(
            slice
                .iter()
                .map(|v| (v / scale).round().clamp(-INT8_MAX, INT8_MAX) as i8),
        );
        scales.push(scale);
    }

    Ok(Buffer::Int8 {
        values,
        scales,
        axis: 0,
    })
}
