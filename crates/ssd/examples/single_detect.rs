//! Runs the detection pipeline on a synthetic network output with a single confident anchor.
//!
//! Use `RUST_LOG=trace` to see the output of every stage.

use miette::Result;
use ndarray::{Array5, Axis};
use ssd::{Bbox, Detector, PostprocessConfig, SsdConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let postprocess = PostprocessConfig {
        select_threshold: Some(0.5),
        ..PostprocessConfig::default()
    };
    let detector = Detector::new(SsdConfig::default(), postprocess)?;
    let num_classes = detector.config().num_classes;
    let anchors = detector.anchors()?;

    let mut predictions = Vec::with_capacity(anchors.len());
    let mut localisations = Vec::with_capacity(anchors.len());
    for layer in anchors.iter() {
        let (rows, cols, per_cell) = layer.grid_shape();

        let mut scores = Array5::<f32>::zeros((1, rows, cols, per_cell, num_classes));
        scores.index_axis_mut(Axis(4), 0).fill(1.0);
        predictions.push(scores);
        localisations.push(Array5::<f32>::zeros((1, rows, cols, per_cell, 4)));
    }

    // the square anchor of the cell (1, 2) of the 4x4 scale sees class 3
    predictions[4][[0, 1, 2, 0, 0]] = 0.1;
    predictions[4][[0, 1, 2, 0, 3]] = 0.9;
    localisations[4][[0, 1, 2, 0, 0]] = 0.5;

    let detections = detector.detect(
        &predictions.iter().map(Array5::view).collect::<Vec<_>>(),
        &localisations.iter().map(Array5::view).collect::<Vec<_>>(),
        Some(Bbox::yxyx(0.0, 0.0, 1.0, 1.0)),
    )?;

    for candidate in &detections[0] {
        let (ymin, xmin, ymax, xmax) = candidate.bbox.inner;
        println!(
            "class {} ({:.2}): [{ymin:.3}, {xmin:.3}, {ymax:.3}, {xmax:.3}]",
            candidate.class_id, candidate.score
        );
    }

    Ok(())
}
