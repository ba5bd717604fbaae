use rust_aa_conv::{AugConvConfig, AugmentedConv2d};
use std::path::Path;
use tch::{Device, Kind, Tensor, nn};
use tracing::info;

const HEIGHT: i64 = 8;
const WIDTH: i64 = 8;
const IN_CHANNELS: i64 = 16;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<tracing_subscriber::filter::LevelFilter>().ok())
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let device = if tch::Cuda::is_available() {
        Device::Cuda(0)
    } else {
        Device::Cpu
    };

    // Config: optional JSON path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => AugConvConfig::from_json(Path::new(&path))?,
        None => AugConvConfig::default(),
    };
    info!(?config, ?device, "augmented conv test environment");

    let batch = config.batch_size.unwrap_or(2);
    let xs = Tensor::randn([batch, HEIGHT, WIDTH, IN_CHANNELS], (Kind::Float, device));

    let vs = nn::VarStore::new(device);
    let layer = AugmentedConv2d::new(&vs.root(), IN_CHANNELS, (HEIGHT, WIDTH), &config)?;
    let (out, weights) = tch::no_grad(|| layer.forward_with_attention(&xs))?;

    let mut per_row = weights.size();
    if let Some(last) = per_row.last_mut() {
        *last = 1;
    }
    let row_sums = weights.sum_to_size(per_row);
    let worst = (row_sums - 1.0).abs().max().double_value(&[]);
    info!(
        input = ?xs.size(),
        output = ?out.size(),
        weights = ?weights.size(),
        worst_row_sum_error = worst,
        "forward pass"
    );

    // Checkpoint round trip through a second store
    let checkpoint = Path::new("./aug_conv.ot");
    vs.save(checkpoint)?;
    let mut restored_vs = nn::VarStore::new(device);
    let restored =
        AugmentedConv2d::new(&restored_vs.root(), IN_CHANNELS, (HEIGHT, WIDTH), &config)?;
    restored_vs.load(checkpoint)?;
    let restored_out = tch::no_grad(|| restored.forward(&xs))?;
    let diff = (&restored_out - &out).abs().max().double_value(&[]);
    info!(path = %checkpoint.display(), max_abs_diff = diff, "checkpoint restored");

    Ok(())
}
