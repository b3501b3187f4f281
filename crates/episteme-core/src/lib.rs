// Forecasting core: prediction groups, scoring, and persistence.

pub mod error;
pub mod export;
pub mod group;
pub mod registry;
pub mod scoring;
pub mod store;

pub use error::ForecastError;
pub use group::{GroupStatus, PredictionGroup, TruthValue, UserId};
pub use registry::{GroupHandle, GroupRegistry, ResolveProgress};
pub use scoring::{MiscalibrationFlag, Participant, Resolution, Score};
pub use store::{FinishedRecord, Store};
