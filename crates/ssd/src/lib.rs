//! Anchor geometry and detection post-processing for Single Shot MultiBox Detectors (SSD).
//!
//! An SSD network predicts, for every anchor of every feature-map scale, a score per class and
//! four box offsets relative to the anchor. This crate provides everything around the network:
//!
//! - [`anchor`]: the anchor boxes of every scale, for a given input shape.
//! - [`box_coder`]: encoding of ground truth boxes as offsets, and decoding of the offsets.
//! - [`matcher`]: assignment of ground truth boxes to anchors, for training.
//! - [`select`], [`sort`] and [`nms`]: the stages that turn scores and boxes into detections.
//! - [`Detector`]: the full pipeline, configured through [`SsdConfig`] and
//!   [`PostprocessConfig`].
//!
//! All boxes are normalized to `[0, 1]` relative to the input height and width.

pub mod anchor;
pub mod bbox;
pub mod box_coder;
pub mod config;
pub mod error;
pub mod matcher;
pub mod meshgrid;
pub mod nms;
pub mod postprocess;
pub mod select;
pub mod sort;

pub use bbox::{Bbox, ConvertBbox, Cyxhw, Yxyx};
pub use config::{PostprocessConfig, PriorScaling, ScaleConfig, SsdConfig};
pub use error::{Error, Result};
pub use postprocess::Detector;
pub use select::Candidate;
