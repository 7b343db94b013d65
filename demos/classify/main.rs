//! Image classification on the accelerator.
//!
//! Usage: cargo run --example classify -- <backend.so> <model.so|model.bin> <image.jpg> [size]
//!
//! Set `RUST_LOG=accel_session=debug` for the session's log output.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use accel_session::preprocess::{Layout, Normalization, Preprocessor};
use accel_session::{default_loader, LogLevel, Logger, Session, SessionConfig};
use tracing_subscriber::EnvFilter;

const IMAGENET_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const IMAGENET_STD: [f32; 3] = [58.395, 57.12, 57.375];

fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: classify <backend.so> <model.so|model.bin> <image.jpg> [size]");
        std::process::exit(1);
    }
    let size: u32 = args.get(4).map(|s| s.parse::<u32>()).transpose()?.unwrap_or(224);

    let config = SessionConfig::new(&args[1], &args[2]);
    let logger = Arc::new(Logger::with_tracing(LogLevel::Info));

    let t0 = Instant::now();
    let mut session = Session::create(config, default_loader().as_ref(), logger)?;
    println!("Session ready in {:.1?} ({:?})", t0.elapsed(), session.family());

    let pre = Preprocessor::new(size, size)?
        .normalization(Normalization::new(IMAGENET_MEAN, IMAGENET_STD)?)
        .layout(Layout::Hwc);
    let input = pre.run_file(Path::new(&args[3]))?;

    let t1 = Instant::now();
    session.load_float_inputs(&[input], 0)?;
    session.execute_graphs()?;
    let outputs = session.get_float_outputs(0)?;
    println!("Inference: {:.1?}", t1.elapsed());

    let Some(scores) = outputs.first() else {
        eprintln!("model has no outputs");
        std::process::exit(1);
    };
    for (class, score) in top_k(scores, 5) {
        println!("  class {class:>5}  score {score:.4}");
    }
    Ok(())
}
