use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Abstract resource units requested by an agent or reserved by a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub storage: f64,
    #[serde(default)]
    pub network: f64,
    #[serde(default)]
    pub gpu: f64,
}

impl ResourceVector {
    pub fn new(cpu: f64, memory: f64, storage: f64, network: f64, gpu: f64) -> Self {
        Self {
            cpu,
            memory,
            storage,
            network,
            gpu,
        }
    }

    /// Only the cpu dimension set; handy for tests and simple agents.
    pub fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// True when every dimension of `self` is within `limits`.
    pub fn fits_within(&self, limits: &ResourceVector) -> bool {
        self.cpu <= limits.cpu
            && self.memory <= limits.memory
            && self.storage <= limits.storage
            && self.network <= limits.network
            && self.gpu <= limits.gpu
    }

    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            storage: (self.storage - other.storage).max(0.0),
            network: (self.network - other.network).max(0.0),
            gpu: (self.gpu - other.gpu).max(0.0),
        }
    }

    pub fn is_non_negative(&self) -> bool {
        self.cpu >= 0.0
            && self.memory >= 0.0
            && self.storage >= 0.0
            && self.network >= 0.0
            && self.gpu >= 0.0
    }

    /// Highest used/limit ratio over the dimensions that have a non-zero limit.
    pub fn utilization(&self, limits: &ResourceVector) -> f64 {
        [
            (self.cpu, limits.cpu),
            (self.memory, limits.memory),
            (self.storage, limits.storage),
            (self.network, limits.network),
            (self.gpu, limits.gpu),
        ]
        .iter()
        .filter(|(_, limit)| *limit > 0.0)
        .map(|(used, limit)| used / limit)
        .fold(0.0, f64::max)
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            storage: self.storage + rhs.storage,
            network: self.network + rhs.network,
            gpu: self.gpu + rhs.gpu,
        }
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: ResourceVector) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for ResourceVector {
    fn sum<I: Iterator<Item = ResourceVector>>(iter: I) -> Self {
        iter.fold(ResourceVector::zero(), Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_within() {
        let limits = ResourceVector::new(4.0, 8.0, 10.0, 1.0, 0.0);
        assert!(ResourceVector::cpu(4.0).fits_within(&limits));
        assert!(!ResourceVector::cpu(4.5).fits_within(&limits));
        assert!(!ResourceVector::new(0.0, 0.0, 0.0, 0.0, 1.0).fits_within(&limits));
    }

    #[test]
    fn test_sum_and_sub() {
        let total: ResourceVector = vec![ResourceVector::cpu(1.0), ResourceVector::cpu(2.0)]
            .into_iter()
            .sum();
        assert_eq!(total.cpu, 3.0);
        let left = total.saturating_sub(&ResourceVector::cpu(5.0));
        assert_eq!(left.cpu, 0.0);
    }

    #[test]
    fn test_utilization_ignores_zero_limits() {
        let limits = ResourceVector::new(4.0, 10.0, 0.0, 0.0, 0.0);
        let used = ResourceVector::new(3.0, 2.0, 0.0, 0.0, 0.0);
        assert!((used.utilization(&limits) - 0.75).abs() < f64::EPSILON);
    }
}
