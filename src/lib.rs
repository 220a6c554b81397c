pub mod archiver;
pub mod config;
pub mod databend;
pub mod ingest;
pub mod planner;
pub mod source;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use archiver::{ArchiveSummary, Archiver};
pub use config::Config;
