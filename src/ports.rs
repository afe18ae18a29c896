//! Deterministic port assignment for adapter processes

use crate::config::BackendSpec;
use crate::error::ConfigError;

/// A backend paired with the local port its adapter listens on
#[derive(Debug, Clone, PartialEq)]
pub struct PortAssignment {
    pub spec: BackendSpec,
    pub port: u16,
}

/// Assign `base + index` to each spec, in the order given.
///
/// Fails only if the range would run past port 65535. Collisions with ports
/// already bound by something else are not detected here; they surface when
/// the adapter fails to bind.
pub fn allocate_ports(
    base: u16,
    specs: Vec<BackendSpec>,
) -> Result<Vec<PortAssignment>, ConfigError> {
    let count = specs.len();
    let last = u32::from(base) + count.saturating_sub(1) as u32;
    if base == 0 || last > u32::from(u16::MAX) {
        return Err(ConfigError::PortRangeExhausted { base, count });
    }

    Ok(specs
        .into_iter()
        .zip(base..=u16::MAX)
        .map(|(spec, port)| PortAssignment { spec, port })
        .collect())
}
