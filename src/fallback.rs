//! Placeholder artifact
//!
//! A small untrained classifier with the same input/output contract as the
//! trained model, built directly as a mobile graph. It exists so the app
//! always has something loadable; its predictions are meaningless.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::config::ExportConfig;
use crate::convert::apply_policy;
use crate::graph::mobile::{Activation, ArtifactOrigin, MobileGraph, MobileGraphBuilder, Padding};
use crate::utils::error::Result;

/// Output channels of the placeholder's conv layers
pub const PLACEHOLDER_FILTERS: [usize; 3] = [32, 64, 128];

/// Width of the placeholder's hidden dense layer
pub const PLACEHOLDER_HIDDEN_UNITS: usize = 64;

const KERNEL: usize = 3;

/// Build the untrained placeholder and apply the configured optimization policy
///
/// Weights come from a generator seeded with `placeholder_seed`, so the same
/// configuration always yields the same artifact bytes.
pub fn synthesize_placeholder(config: &ExportConfig) -> Result<MobileGraph> {
    warn!("Building UNTRAINED placeholder model; predictions will be random");

    let mut rng = ChaCha8Rng::seed_from_u64(config.placeholder_seed);
    let mut builder = MobileGraphBuilder::new();

    let input = builder.add_input("input", &config.mobile_input_shape());
    let mut x = input;
    let mut in_channels = config.input.channels;

    for (index, &filters) in PLACEHOLDER_FILTERS.iter().enumerate() {
        let name = format!("conv{}", index + 1);
        let fan_in = KERNEL * KERNEL * in_channels;
        let fan_out = KERNEL * KERNEL * filters;
        let kernel = glorot_uniform(&mut rng, fan_in, fan_out, filters * fan_in);

        let filter = builder.add_constant(
            &format!("{}/kernel", name),
            &[filters, KERNEL, KERNEL, in_channels],
            kernel,
        )?;
        let bias = builder.add_constant(&format!("{}/bias", name), &[filters], vec![0.0; filters])?;
        x = builder.conv2d(&name, x, filter, Some(bias), [1, 1], Padding::Same, Activation::Relu)?;

        // Pool after every conv except the last, which feeds global pooling
        if index + 1 < PLACEHOLDER_FILTERS.len() {
            x = builder.max_pool2d(&format!("pool{}", index + 1), x, [2, 2], [2, 2], Padding::Valid)?;
        }
        in_channels = filters;
    }

    x = builder.mean("global_pool", x, &[1, 2], false)?;

    let num_classes = config.num_classes();
    let mut in_features = in_channels;
    for (name, units, activation) in [
        ("dense1", PLACEHOLDER_HIDDEN_UNITS, Activation::Relu),
        ("dense2", num_classes, Activation::None),
    ] {
        let kernel = glorot_uniform(&mut rng, in_features, units, units * in_features);
        let weights = builder.add_constant(&format!("{}/kernel", name), &[units, in_features], kernel)?;
        let bias = builder.add_constant(&format!("{}/bias", name), &[units], vec![0.0; units])?;
        x = builder.fully_connected(name, x, weights, Some(bias), activation)?;
        in_features = units;
    }

    let output = builder.softmax("output", x, 1.0)?;
    builder.mark_output(output);

    let mut graph = builder.build(ArtifactOrigin::Placeholder);
    apply_policy(&mut graph, &config.optimization)?;

    info!(
        "Placeholder model built: {} operators, {} classes",
        graph.operators.len(),
        num_classes
    );
    Ok(graph)
}

/// Glorot-uniform values in `[-limit, limit)`, `limit = sqrt(6 / (fan_in + fan_out))`
fn glorot_uniform(rng: &mut ChaCha8Rng, fan_in: usize, fan_out: usize, count: usize) -> Vec<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    (0..count).map(|_| rng.gen_range(-limit..limit)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SupportedOps, WeightPrecision};
    use crate::graph::mobile::Buffer;

    fn small_config() -> ExportConfig {
        let mut config = ExportConfig::default();
        config.input.image_size = 16;
        config.architecture.num_blocks = 2;
        config
    }

    #[test]
    fn test_placeholder_io_contract() {
        let config = small_config();
        let graph = synthesize_placeholder(&config).unwrap();

        assert!(graph.is_placeholder());
        assert_eq!(graph.input_tensor().unwrap().shape, vec![1, 16, 16, 3]);
        assert_eq!(graph.input_tensor().unwrap().shape_signature, vec![-1, 16, 16, 3]);
        assert_eq!(graph.output_tensor().unwrap().shape, vec![1, 4]);
        graph.check(SupportedOps::BuiltinsOnly).unwrap();
    }

    #[test]
    fn test_placeholder_is_deterministic() {
        let config = small_config();
        let first = synthesize_placeholder(&config).unwrap().to_bytes().unwrap();
        let second = synthesize_placeholder(&config).unwrap().to_bytes().unwrap();
        assert_eq!(first, second);

        let mut reseeded = config.clone();
        reseeded.placeholder_seed = 7;
        let third = synthesize_placeholder(&reseeded).unwrap().to_bytes().unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_placeholder_follows_policy() {
        let mut config = small_config();
        let half = synthesize_placeholder(&config).unwrap();
        assert!(half.buffers.iter().all(|b| matches!(b, Buffer::F16(_))));

        config.optimization.weight_precision = WeightPrecision::Float32;
        let quantized = synthesize_placeholder(&config).unwrap();
        assert!(quantized
            .buffers
            .iter()
            .any(|b| matches!(b, Buffer::Int8 { .. })));
    }

    #[test]
    fn test_glorot_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let values = glorot_uniform(&mut rng, 27, 288, 1000);
        let limit = (6.0f32 / 315.0).sqrt();
        assert!(values.iter().all(|v| v.abs() <= limit));
    }
}
