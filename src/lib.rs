//! foresters: random-forest training and prediction for tabular data.
//!
//! Trains ensembles of decision trees on dense or sparse predictor
//! matrices for classification and regression, with several splitting
//! rules (Gini / variance sum-of-squares, extremely randomised trees,
//! maximally-selected rank statistics, beta log-likelihood, Hellinger
//! distance for binary classification), out-of-bag error estimation,
//! three prediction modes, forest merging, and a binary model format.
//!
//! # Key types
//!
//! - [`RandomForest`] / [`RandomForestSettings`] - high-level train/predict
//! - [`Data`], [`DenseMatrix`], [`SparseColMatrix`] - predictor/response views
//! - [`Forest`] - mid-level orchestration (plant / predict / merge)
//! - [`Monitor`] - injected progress sink and interrupt probe
//!
//! # Training
//!
//! Build a [`Data`] view, fill in [`RandomForestSettings`], then call
//! [`RandomForest::train`]. Prediction modes are "bagged" (bootstrap
//! aggregation), "inbag" (a draw from one tree's in-bag sample, the
//! multiple-imputation primitive), and "nodes" (terminal node indexes).

pub mod data;
pub mod draw;
pub mod errors;
pub mod forest;
pub mod io;
pub mod maths;
pub mod model;
pub mod params;
pub mod progress;
pub mod testing;
pub mod tree;
pub mod utils;

pub use data::{Data, DenseMatrix, PredictorMatrix, SparseColMatrix};
pub use errors::{Error, Result};
pub use forest::{merge_forests, Forest, ForestKind, PlantOptions, PredictOptions, Predictions};
pub use model::{RandomForest, RandomForestSettings};
pub use params::{PredictionType, SplitRule, TrainingParameters, TreeType};
pub use progress::{Monitor, NullSink, ProgressSink, StderrSink};
pub use tree::SplitValue;
pub use utils::Parallelism;
