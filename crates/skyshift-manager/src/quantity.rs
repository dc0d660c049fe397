//! Kubernetes quantity parsing
//!
//! Node capacities arrive as Kubernetes quantity strings ("500m",
//! "16Gi", "2"). SkyShift counts CPUs as cores and memory/disk in
//! megabytes.

use skyshift_common::{Error, Result};

/// Parse a CPU quantity into cores ("500m" → 0.5, "2" → 2.0)
pub fn parse_cpu(quantity: &str) -> Result<f64> {
    let q = quantity.trim();
    if let Some(millis) = q.strip_suffix('m') {
        let value: f64 = millis
            .parse()
            .map_err(|_| invalid(quantity, "cpu"))?;
        return Ok(value / 1000.0);
    }
    q.parse().map_err(|_| invalid(quantity, "cpu"))
}

/// Parse a memory/storage quantity into megabytes ("16Gi" → 16384.0)
pub fn parse_memory_mb(quantity: &str) -> Result<f64> {
    let q = quantity.trim();
    let (digits, factor) = match q {
        _ if q.ends_with("Ki") => (&q[..q.len() - 2], 1.0 / 1024.0),
        _ if q.ends_with("Mi") => (&q[..q.len() - 2], 1.0),
        _ if q.ends_with("Gi") => (&q[..q.len() - 2], 1024.0),
        _ if q.ends_with("Ti") => (&q[..q.len() - 2], 1024.0 * 1024.0),
        _ if q.ends_with('k') => (&q[..q.len() - 1], 1e3 / 1e6),
        _ if q.ends_with('M') => (&q[..q.len() - 1], 1.0),
        _ if q.ends_with('G') => (&q[..q.len() - 1], 1e3),
        _ if q.ends_with('T') => (&q[..q.len() - 1], 1e6),
        // Bare bytes.
        _ => (q, 1.0 / (1024.0 * 1024.0)),
    };
    let value: f64 = digits.parse().map_err(|_| invalid(quantity, "memory"))?;
    Ok(value * factor)
}

/// Parse a plain count ("4" → 4.0)
pub fn parse_count(quantity: &str) -> Result<f64> {
    quantity
        .trim()
        .parse()
        .map_err(|_| invalid(quantity, "count"))
}

fn invalid(quantity: &str, kind: &str) -> Error {
    Error::transient(
        "kubernetes",
        format!("unparsable {kind} quantity '{quantity}'"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
        assert_eq!(parse_cpu("500m").unwrap(), 0.5);
        assert_eq!(parse_cpu("1500m").unwrap(), 1.5);
        assert!(parse_cpu("two").is_err());
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_memory_mb("1024Mi").unwrap(), 1024.0);
        assert_eq!(parse_memory_mb("16Gi").unwrap(), 16384.0);
        assert_eq!(parse_memory_mb("1Ti").unwrap(), 1024.0 * 1024.0);
        assert_eq!(parse_memory_mb("1048576Ki").unwrap(), 1024.0);
        // Bare bytes round down to fractional MB.
        assert_eq!(parse_memory_mb("1048576").unwrap(), 1.0);
    }

    #[test]
    fn test_count_quantities() {
        assert_eq!(parse_count("4").unwrap(), 4.0);
        assert!(parse_count("").is_err());
    }
}
