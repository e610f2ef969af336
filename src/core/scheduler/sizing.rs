//! Worker-pool sizing policy.
//!
//! The pool never trusts the task file alone: the requested `max_parallel`
//! is capped by an absolute bound derived from the CPU count and scaled
//! down when coordination variables reveal that several engine instances
//! (or a nested invocation) share the machine.
use std::env;

/// Coordination variable: how many engine instances run side by side.
pub const ENV_PARALLEL_INSTANCES: &str = "TASKER_PARALLEL_INSTANCES";
/// Coordination variable: nesting depth of this invocation.
pub const ENV_NESTED_LEVEL: &str = "TASKER_NESTED_LEVEL";
/// CI/orchestrator variables whose presence implies co-executing
/// instances even when the explicit count is unset.
pub const AUTODETECT_VARS: &[&str] = &["PARALLEL_INSTANCE_ID", "CI_NODE_INDEX"];
/// Conservative instance count assumed on auto-detection.
pub const AUTODETECT_INSTANCES: u32 = 10;
/// Upper bound on the sanitized instance count.
pub const MAX_PARALLEL_INSTANCES: u32 = 1000;

/// Inputs of the sizing decision, read from the environment exactly once
/// per workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    pub cpus: usize,
    pub parallel_instances: u32,
    pub nested_level: u32,
}

impl PoolPolicy {
    /// Read the coordination environment.
    pub fn from_env() -> Self {
        let explicit = env::var(ENV_PARALLEL_INSTANCES).ok();
        let autodetected = explicit.is_none()
            && AUTODETECT_VARS.iter().any(|var| env::var(var).is_ok());
        Self {
            cpus: num_cpus::get(),
            parallel_instances: sanitize_instances(explicit.as_deref(), autodetected),
            nested_level: sanitize_nested_level(env::var(ENV_NESTED_LEVEL).ok().as_deref()),
        }
    }

    /// Fixed inputs, for tests and for nested invocations that inherit a
    /// parent's reading.
    pub fn fixed(cpus: usize, parallel_instances: u32, nested_level: u32) -> Self {
        Self {
            cpus,
            parallel_instances,
            nested_level,
        }
    }

    /// The effective pool size for a requested `max_parallel`.
    pub fn effective_size(&self, requested: usize) -> usize {
        let cpus = self.cpus.max(1);
        let mut absolute = if cpus <= 4 {
            50
        } else if cpus <= 8 {
            75
        } else {
            100
        };
        let mut recommended = cpus * 4;

        let instances = self.parallel_instances.max(1) as usize;
        if instances > 1 {
            absolute = (absolute / instances).max(10);
            recommended = ((cpus * 2) / instances).max(1);
        }

        let effective = requested.min(recommended).min(absolute).max(1);
        if effective < requested {
            log::debug!(
                "parallel pool capped: requested {}, effective {} (cpus={}, instances={}, nested_level={})",
                requested,
                effective,
                cpus,
                self.parallel_instances,
                self.nested_level
            );
        }
        effective
    }
}

/// Sanitize the instance count: unparsable or non-positive values count
/// as a single instance, the cap bounds runaway values, and unset falls
/// back to the auto-detected assumption.
pub fn sanitize_instances(raw: Option<&str>, autodetected: bool) -> u32 {
    let Some(raw) = raw else {
        return if autodetected { AUTODETECT_INSTANCES } else { 1 };
    };
    match raw.trim().parse::<i64>() {
        Ok(value) if value >= 1 => (value as u64).min(MAX_PARALLEL_INSTANCES as u64) as u32,
        Ok(value) => {
            log::debug!(
                "{}={} sanitized to 1 (non-positive)",
                ENV_PARALLEL_INSTANCES,
                value
            );
            1
        }
        Err(_) => {
            log::debug!(
                "{}='{}' sanitized to 1 (not a number)",
                ENV_PARALLEL_INSTANCES,
                raw
            );
            1
        }
    }
}

/// Sanitize the nested level: anything unparsable or negative is depth 0.
pub fn sanitize_nested_level(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else { return 0 };
    match raw.trim().parse::<i64>() {
        Ok(value) if value >= 0 => value.min(u32::MAX as i64) as u32,
        _ => {
            log::debug!("{}='{}' sanitized to 0", ENV_NESTED_LEVEL, raw);
            0
        }
    }
}
