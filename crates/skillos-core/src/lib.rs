pub mod answer;
pub mod circuit;
pub mod config;
pub mod events;
pub mod heuristics;
pub mod manifest;
pub mod types;

pub use circuit::{Admission, BreakerPolicy, CircuitPhase, CircuitSnapshot, CircuitState};
pub use config::Config;
pub use heuristics::HeuristicTable;
pub use manifest::HandlerManifest;
pub use types::*;
