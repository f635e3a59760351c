//! Client for the master's direct-report endpoint

pub mod report;

pub use report::{ClientError, ReportClient, ReportClientTrait};
pub use crate::config::TlsFiles;
