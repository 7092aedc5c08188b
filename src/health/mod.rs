//! Sector Health Subsystem
//!
//! Per-sector rolling reliability statistics ([`tracker`]) and the
//! failure-prediction pipeline layered on top of them ([`predict`]).
//! All scoring is integer-only.

pub mod predict;
pub mod tracker;

pub use predict::{FailurePrediction, PredictiveAnalyzer, SystemTrend};
pub use tracker::{HealthTracker, RiskLevel, SectorHealth, Trend};
