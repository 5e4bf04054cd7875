//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, intervals > 0)
//! - Reject socket addresses that cannot be bound
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ControlConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{ControlConfig, MAX_VALIDITY_DAYS, PLACEHOLDER_API_KEY};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is not a valid socket address: {value}")]
    BadAddress { field: &'static str, value: String },

    #[error("{field} must not exceed {max}")]
    TooLarge { field: &'static str, max: i64 },

    #[error("supervisor.binary must not be empty")]
    EmptyBinary,

    #[error("admin.api_key must be set when the admin surface is enabled")]
    WeakAdminKey,
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ControlConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let positive = [
        ("scheduler.enforcement_interval_secs", config.scheduler.enforcement_interval_secs),
        ("scheduler.metering_interval_secs", config.scheduler.metering_interval_secs),
        ("probe.timeout_secs", config.probe.timeout_secs),
        ("supervisor.stop_timeout_secs", config.supervisor.stop_timeout_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }
    if config.scheduler.expiry_warning_days <= 0 {
        errors.push(ValidationError::Zero { field: "scheduler.expiry_warning_days" });
    }
    let validity = config.subscribers.default_validity_days;
    if validity <= 0 {
        errors.push(ValidationError::Zero { field: "subscribers.default_validity_days" });
    } else if validity > MAX_VALIDITY_DAYS {
        errors.push(ValidationError::TooLarge {
            field: "subscribers.default_validity_days",
            max: MAX_VALIDITY_DAYS,
        });
    }

    if config.supervisor.binary.trim().is_empty() {
        errors.push(ValidationError::EmptyBinary);
    }

    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        let key = config.admin.api_key.trim();
        if key.is_empty() || key == PLACEHOLDER_API_KEY {
            errors.push(ValidationError::WeakAdminKey);
        }
    }
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BadAddress {
            field,
            value: value.to_string(),
        });
    }
}
