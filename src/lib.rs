//! Library crate behind the `inference_skill_dalle` binary.
//!
//! Loads a DALLE checkpoint together with its VQGAN decoder, walks a
//! skill dataset of captions and writes one generated PNG per example.

pub mod app;
pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod model;
pub mod naming;
pub mod pipeline;
pub mod tokenizer;
pub mod weights;
