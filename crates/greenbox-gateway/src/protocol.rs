//! Gateway HTTP protocol — JSON bodies exchanged with clients

use greenbox_core::{PowerAssumptions, RunPatch, RunReport};
use serde::{Deserialize, Serialize};

/// Body of `GET /`
pub const LIVENESS: &str = "greenbox gateway is running";

pub const STATUS_SUCCESS: &str = "success";
pub const MESSAGE_COMPLETED: &str = "Code analysis completed.";

/// Client → Gateway: `POST /upload_data`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub data: RunPatch,
}

/// Gateway → Client on success
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    pub message: String,
    pub results: RunResults,
}

/// The subset of a run report returned to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub exit_code: i64,
    pub runtime_seconds: f64,
    pub samples_collected: usize,
    pub avg_cpu_percent: f64,
    pub avg_mem_mib: f64,
    pub peak_mem_mib: f64,
    pub avg_power_watt: f64,
    pub energy_kwh: f64,
    pub power_assumptions_used: PowerAssumptions,
    pub co2_rate: Option<f64>,
    pub co2_grams: Option<f64>,
}

/// Gateway → Client on any failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl RunResults {
    pub fn from_report(report: &RunReport, co2_rate: Option<f64>) -> Self {
        Self {
            exit_code: report.exit_code,
            runtime_seconds: report.runtime_seconds,
            samples_collected: report.samples_collected,
            avg_cpu_percent: report.avg_cpu_percent,
            avg_mem_mib: report.avg_mem_mib,
            peak_mem_mib: report.peak_mem_mib,
            avg_power_watt: report.avg_power_watt,
            energy_kwh: report.energy_kwh,
            power_assumptions_used: report.power_assumptions.clone(),
            co2_rate,
            co2_grams: report.co2_grams,
        }
    }
}

impl UploadResponse {
    pub fn completed(results: RunResults) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            message: MESSAGE_COMPLETED.to_string(),
            results,
        }
    }
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
