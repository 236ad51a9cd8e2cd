//! Bouquet detection and color analysis: a two-pass detection-fusion pipeline
//! (primary pass plus a low-confidence rescan reconciled over a candidate
//! lattice), per-region color descriptors, and YOLO-family ONNX backends.

pub mod colors;
pub mod config;
pub mod detection;
pub mod detector;
pub mod geometry;
pub mod onnx_session;
pub mod pipeline;
pub mod planner;
pub mod prefilter;
pub mod reconcile;
pub mod segmentation;
pub mod yolo;
