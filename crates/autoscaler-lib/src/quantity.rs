//! Resource quantity conversion
//!
//! Every utilization and capacity comparison is done in millicores for CPU
//! and MB for memory. Only the suffixes the orchestration API actually
//! reports for usage and allocatable capacity are accepted.

use crate::error::{Result, ScalerError};

/// Split a quantity into its integer magnitude and unit suffix
fn split_quantity(value: &str) -> Result<(i64, &str)> {
    let value = value.trim();
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());

    if digits_end == 0 {
        return Err(ScalerError::InvalidQuantity(value.to_string()));
    }

    let magnitude = value[..digits_end]
        .parse::<i64>()
        .map_err(|_| ScalerError::InvalidQuantity(value.to_string()))?;

    Ok((magnitude, &value[digits_end..]))
}

/// Convert a CPU quantity to millicores
///
/// `"500m"` is 500, `"2"` is 2000, `"250000000n"` is 250 and `"1500u"` is 1.
pub fn convert_cpu(value: &str) -> Result<i64> {
    let (n, unit) = split_quantity(value)?;
    match unit {
        "m" => Ok(n),
        "" => n
            .checked_mul(1000)
            .ok_or_else(|| ScalerError::InvalidQuantity(value.to_string())),
        "n" => Ok(n / 1_000_000),
        "u" => Ok(n / 1000),
        _ => Err(ScalerError::InvalidQuantity(value.to_string())),
    }
}

/// Convert a memory quantity to MB
///
/// Binary and decimal suffixes are treated alike, matching what the
/// metrics pipeline has always assumed.
pub fn convert_memory(value: &str) -> Result<i64> {
    let (n, unit) = split_quantity(value)?;
    match unit {
        "Mi" | "M" => Ok(n),
        "Ki" | "K" => Ok(n / 1024),
        "Gi" | "G" => n
            .checked_mul(1024)
            .ok_or_else(|| ScalerError::InvalidQuantity(value.to_string())),
        _ => Err(ScalerError::InvalidQuantity(value.to_string())),
    }
}

/// Convert an optional quantity, treating a missing value as malformed
pub fn convert_cpu_opt(value: Option<&str>) -> Result<i64> {
    convert_cpu(value.ok_or_else(|| ScalerError::InvalidQuantity(String::new()))?)
}

/// Memory counterpart of `convert_cpu_opt`
pub fn convert_memory_opt(value: Option<&str>) -> Result<i64> {
    convert_memory(value.ok_or_else(|| ScalerError::InvalidQuantity(String::new()))?)
}
