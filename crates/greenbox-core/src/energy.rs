//! Energy estimation — turn sampled container usage into power and energy figures

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::stats::{Sample, parse_cpu_percent};

/// Power model used to convert utilisation into watts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerAssumptions {
    #[serde(default)]
    pub notes: String,
    pub cpu_per_core_watt: f64,
    pub ram_per_gb_watt: f64,
    pub baseline_container_watt: f64,
}

/// Why a usage summary could not be produced
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    #[error("No statistics were collected.")]
    NoSamples,
    #[error("Run duration was zero or negative.")]
    ZeroDuration,
    #[error("Stats collected but count is zero or parsing failed.")]
    NoValidSamples,
}

/// Aggregated usage and the energy estimate derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub samples_collected: usize,
    pub avg_cpu_percent: f64,
    pub avg_mem_mib: f64,
    pub peak_mem_mib: f64,
    pub avg_power_watt: f64,
    pub energy_kwh: f64,
}

/// Number of cores a CFS quota/period pair grants the container
pub fn allocated_cores(cpu_quota: u64, cpu_period: u64) -> f64 {
    if cpu_period == 0 {
        return 0.0;
    }
    cpu_quota as f64 / cpu_period as f64
}

/// Round to a fixed number of decimal places
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Grams of CO2 for an energy figure at a given grid intensity (g/kWh)
pub fn co2_grams(energy_kwh: f64, co2_rate: f64) -> f64 {
    energy_kwh * co2_rate
}

/// Summarize samples over a run of `duration_secs`.
///
/// Samples whose CPU figure cannot be parsed are skipped. Non-finite
/// readings do not contribute to the sums but still count towards the
/// averages.
pub fn summarize(
    samples: &[Sample],
    duration_secs: f64,
    cores: f64,
    power: &PowerAssumptions,
) -> Result<UsageSummary, StatsError> {
    if samples.is_empty() {
        return Err(StatsError::NoSamples);
    }
    if duration_secs <= 0.0 {
        return Err(StatsError::ZeroDuration);
    }

    let mut total_cpu = 0.0;
    let mut total_mem = 0.0;
    let mut peak_mem: f64 = 0.0;
    let mut count = 0usize;

    for sample in samples {
        let Some(cpu) = parse_cpu_percent(&sample.cpu_perc) else {
            warn!("Energy: could not parse stats entry {:?}", sample);
            continue;
        };
        if cpu.is_finite() {
            total_cpu += cpu;
        }
        if sample.mem_usage_mib.is_finite() {
            total_mem += sample.mem_usage_mib;
            peak_mem = peak_mem.max(sample.mem_usage_mib);
        }
        count += 1;
    }

    if count == 0 {
        return Err(StatsError::NoValidSamples);
    }

    let avg_cpu = total_cpu / count as f64;
    let avg_mem = total_mem / count as f64;

    let cpu_watt = (avg_cpu / 100.0) * cores * power.cpu_per_core_watt;
    let ram_watt = (avg_mem / 1024.0) * power.ram_per_gb_watt;
    let avg_power = cpu_watt + ram_watt + power.baseline_container_watt;
    let energy_kwh = (avg_power / 1000.0) * (duration_secs / 3600.0);

    debug!(
        "Energy: {} samples, cpu={:.2}%, mem={:.2}MiB, power={:.3}W over {:.2}s",
        count, avg_cpu, avg_mem, avg_power, duration_secs
    );

    Ok(UsageSummary {
        samples_collected: samples.len(),
        avg_cpu_percent: round_to(avg_cpu, 2),
        avg_mem_mib: round_to(avg_mem, 2),
        peak_mem_mib: round_to(peak_mem, 2),
        avg_power_watt: round_to(avg_power, 3),
        energy_kwh,
    })
}
