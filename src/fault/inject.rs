use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Deterministic failure schedule for simulated venues.
///
/// Faults depend only on `(seed, op_key, attempt)`, so a replayed run fails in
/// exactly the same places.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    /// Every op key fails this many times before the venue answers.
    pub fail_first: u32,
    /// Probability in `[0, 1]` that any later attempt times out.
    pub timeout_rate: f64,
    pub seed: u64,
    attempts: HashMap<String, u32>,
}

impl FaultPlan {
    pub fn disabled() -> Self {
        Self::new(0, 0.0, 0)
    }

    pub fn fail_first(n: u32) -> Self {
        Self::new(n, 0.0, 0)
    }

    pub fn new(fail_first: u32, timeout_rate: f64, seed: u64) -> Self {
        Self {
            fail_first,
            timeout_rate: timeout_rate.clamp(0.0, 1.0),
            seed,
            attempts: HashMap::new(),
        }
    }

    /// Record an attempt for `op_key` and report whether it should fail.
    pub fn next_attempt_fails(&mut self, op_key: &str) -> bool {
        let attempt = self.attempts.entry(op_key.to_string()).or_insert(0);
        *attempt += 1;
        if *attempt <= self.fail_first {
            return true;
        }
        should_fault(fault_seed(self.seed, op_key, *attempt), self.timeout_rate)
    }
}

pub fn fault_seed(seed: u64, op_key: &str, attempt: u32) -> u64 {
    let digest = Sha256::digest(format!("{}|{}|{}", seed, op_key, attempt).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

pub fn should_fault(seed: u64, rate: f64) -> bool {
    let v = (seed % 10_000) as f64 / 10_000.0;
    v < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_first_is_per_key() {
        let mut plan = FaultPlan::fail_first(2);
        assert!(plan.next_attempt_fails("a"));
        assert!(plan.next_attempt_fails("b"));
        assert!(plan.next_attempt_fails("a"));
        assert!(!plan.next_attempt_fails("a"));
        assert!(plan.next_attempt_fails("b"));
        assert!(!plan.next_attempt_fails("b"));
    }

    #[test]
    fn test_rate_extremes() {
        let mut never = FaultPlan::new(0, 0.0, 7);
        let mut always = FaultPlan::new(0, 1.0, 7);
        for i in 0..50 {
            let key = format!("k{}", i);
            assert!(!never.next_attempt_fails(&key));
            assert!(always.next_attempt_fails(&key));
        }
    }

    #[test]
    fn test_schedule_is_reproducible() {
        let run = || {
            let mut plan = FaultPlan::new(0, 0.3, 42);
            (0..100).map(|i| plan.next_attempt_fails(&format!("k{}", i % 7))).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
