//! Resource accounting shared by the scheduler and cluster backends
//!
//! Resources are string-keyed quantity maps so that accelerator SKUs
//! (`V100`, `A100`, ...) can live alongside the core resource names without
//! schema churn. Memory and disk are counted in megabytes.

use std::collections::BTreeMap;

/// Core resource name: CPU cores
pub const CPUS: &str = "cpus";
/// Core resource name: memory in MB
pub const MEMORY: &str = "memory";
/// Core resource name: generic GPU count
pub const GPUS: &str = "gpus";
/// Core resource name: disk in MB
pub const DISK: &str = "disk";

/// Accelerator SKUs accepted in resource maps
pub const ACCELERATORS: &[&str] = &[
    "T4", "L4", "P4", "P100", "V100", "A10", "A100", "H100", "TPU-V4",
];

/// Quantities for a single node or a single replica
pub type ResourceMap = BTreeMap<String, f64>;

/// Per-node resource quantities for a whole cluster
pub type NodeResourceMap = BTreeMap<String, ResourceMap>;

/// Returns true for resource names the object model accepts
pub fn is_valid_resource(name: &str) -> bool {
    matches!(name, CPUS | MEMORY | GPUS | DISK) || ACCELERATORS.contains(&name)
}

/// Returns true if `name` is an accelerator SKU rather than a core resource
pub fn is_accelerator(name: &str) -> bool {
    ACCELERATORS.contains(&name)
}

/// Default resource request for a job replica: one CPU, nothing else
pub fn default_job_resources() -> ResourceMap {
    BTreeMap::from([
        (CPUS.to_string(), 1.0),
        (MEMORY.to_string(), 0.0),
        (GPUS.to_string(), 0.0),
    ])
}

/// Check whether a single `request` fits into `available`.
///
/// Zero-valued requests are ignored. A generic GPU request is satisfied by
/// any accelerator SKU the node exposes.
pub fn fits(available: &ResourceMap, request: &ResourceMap) -> bool {
    for (name, wanted) in request {
        if *wanted <= 0.0 {
            continue;
        }
        if name == GPUS {
            let total_accel: f64 = available
                .iter()
                .filter(|(k, _)| is_accelerator(k) || *k == GPUS)
                .map(|(_, v)| *v)
                .sum();
            if total_accel < *wanted {
                return false;
            }
            continue;
        }
        if available.get(name).copied().unwrap_or(0.0) < *wanted {
            return false;
        }
    }
    true
}

/// Subtract `request` from `available` in place, clamping at zero.
///
/// A generic GPU request drains accelerator SKUs after the `gpus` counter
/// is exhausted, mirroring how [`fits`] admits them.
pub fn subtract(available: &mut ResourceMap, request: &ResourceMap) {
    for (name, wanted) in request {
        if *wanted <= 0.0 {
            continue;
        }
        if name == GPUS {
            let mut remaining = *wanted;
            let generic = available.entry(GPUS.to_string()).or_insert(0.0);
            let taken = remaining.min(*generic);
            *generic -= taken;
            remaining -= taken;
            if remaining > 0.0 {
                for sku in ACCELERATORS {
                    if remaining <= 0.0 {
                        break;
                    }
                    if let Some(count) = available.get_mut(*sku) {
                        let taken = remaining.min(*count);
                        *count -= taken;
                        remaining -= taken;
                    }
                }
            }
            continue;
        }
        let entry = available.entry(name.clone()).or_insert(0.0);
        *entry = (*entry - wanted).max(0.0);
    }
}

/// Count how many whole replicas of `request` fit across a cluster's nodes
pub fn replica_capacity(nodes: &NodeResourceMap, request: &ResourceMap) -> u32 {
    let mut count = 0u32;
    for node in nodes.values() {
        let mut remaining = node.clone();
        while fits(&remaining, request) {
            subtract(&mut remaining, request);
            count += 1;
            // A zero-valued request would fit forever
            if request.values().all(|v| *v <= 0.0) {
                break;
            }
        }
    }
    count
}

/// Sum one resource across all nodes
pub fn total_of(nodes: &NodeResourceMap, name: &str) -> f64 {
    nodes.values().map(|n| n.get(name).copied().unwrap_or(0.0)).sum()
}

/// Sum all accelerator SKUs plus generic GPUs across all nodes
pub fn total_accelerators(nodes: &NodeResourceMap) -> f64 {
    nodes
        .values()
        .flat_map(|n| n.iter())
        .filter(|(k, _)| is_accelerator(k) || k.as_str() == GPUS)
        .map(|(_, v)| *v)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(cpus: f64, memory: f64, gpus: f64) -> ResourceMap {
        BTreeMap::from([
            (CPUS.to_string(), cpus),
            (MEMORY.to_string(), memory),
            (GPUS.to_string(), gpus),
        ])
    }

    #[test]
    fn test_fits_ignores_zero_requests() {
        let available = node(2.0, 0.0, 0.0);
        let request = node(1.0, 0.0, 0.0);
        assert!(fits(&available, &request));
    }

    #[test]
    fn test_fits_rejects_oversized_request() {
        let available = node(2.0, 4096.0, 0.0);
        let request = node(4.0, 0.0, 0.0);
        assert!(!fits(&available, &request));
    }

    #[test]
    fn test_generic_gpu_request_matches_accelerator_sku() {
        let mut available = node(8.0, 16384.0, 0.0);
        available.insert("V100".to_string(), 2.0);
        let mut request = node(1.0, 0.0, 0.0);
        request.insert(GPUS.to_string(), 1.0);
        assert!(fits(&available, &request));

        subtract(&mut available, &request);
        assert_eq!(available["V100"], 1.0);
        assert_eq!(available[CPUS], 7.0);
    }

    #[test]
    fn test_replica_capacity_counts_per_node() {
        // Two nodes with 2 CPUs each hold four 1-CPU replicas
        let nodes = NodeResourceMap::from([
            ("node-0".to_string(), node(2.0, 8192.0, 0.0)),
            ("node-1".to_string(), node(2.0, 8192.0, 0.0)),
        ]);
        let request = node(1.0, 0.0, 0.0);
        assert_eq!(replica_capacity(&nodes, &request), 4);

        let big = node(3.0, 0.0, 0.0);
        assert_eq!(replica_capacity(&nodes, &big), 0);
    }

    #[test]
    fn test_subtract_clamps_at_zero() {
        let mut available = node(1.0, 100.0, 0.0);
        let request = node(2.0, 50.0, 0.0);
        subtract(&mut available, &request);
        assert_eq!(available[CPUS], 0.0);
        assert_eq!(available[MEMORY], 50.0);
    }
}
