//! CipherScope Training
//!
//! Job-agnostic building blocks for algorithm identification:
//! - Validating uploads (`validate`, `Dataset`)
//! - Extracting fixed-length feature vectors (`extract`, `FeatureAccumulator`)
//! - Classifying against a trained model (`classify`)
//! - Storing and activating models (`ModelRegistry`)
//! - Running multi-phase training (`TrainingOrchestrator`)

pub mod artifacts;
pub mod cache;
pub mod catalog;
pub mod classifier;
pub mod dataset;
pub mod error;
pub mod features;
pub mod layout;
pub mod progress;
pub mod registry;
pub mod request;
pub mod trainer;
pub mod validator;

pub use cache::{FeatureStore, LayeredFeatureStore, MemoryFeatureCache};
pub use catalog::{AlgorithmFamily, UNKNOWN_LABEL};
pub use classifier::{classify, ClassificationResult, ClassifierConfig, LabelProbability, ModelParams};
pub use dataset::{Dataset, DatasetFormat, DatasetId, LabeledDataset};
pub use error::{TrainingError, TrainingResult};
pub use features::{extract, extract_incremental, ExtractionProgress, FeatureSample, FeatureVector};
pub use layout::RegistryLayout;
pub use progress::{ProgressEvent, ProgressSink, TrainingPhase};
pub use registry::{Model, ModelId, ModelRegistry, Provenance, ValidationMethod, ValidationReport};
pub use request::{TrainingHyperParams, TrainingRequest, TrainingSample};
pub use trainer::{LabeledFeatures, RunContext, TrainerSettings, TrainingOrchestrator, TrainingSummary};
pub use validator::{validate, Rejection};
