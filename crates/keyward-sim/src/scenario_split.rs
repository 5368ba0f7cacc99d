/// Split scenario: the secret sharing engine on its own.
///
/// Splits a secret, reconstructs it from every `threshold`-sized subset of
/// shares and checks that one share too few is refused.
use std::time::Instant;

use keyward_protocol::{reconstruct, split, KeyIdentity, ShardData};

use crate::scenario_common::{timed_step, GroupShape, ScenarioResult};

pub fn run(shape: GroupShape, secret: &[u8]) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("split");
    let start = Instant::now();
    let creator = KeyIdentity::from_seed([1; 32]).identity();

    let mut shards: Vec<ShardData> = Vec::new();
    let step = timed_step("split secret", || {
        shards = split(secret, shape.threshold, shape.stewards, creator, 0)
            .map_err(|e| format!("split failed: {e}"))?;
        Ok(format!(
            "{} bytes into {} shares, threshold {}",
            secret.len(),
            shards.len(),
            shape.threshold
        ))
    });
    if !result.check(step) {
        result.finalize(start);
        return Ok(result);
    }

    let subsets = combinations(shards.len(), shape.threshold);
    let step = timed_step("reconstruct every threshold subset", || {
        for subset in &subsets {
            let chosen: Vec<ShardData> = subset.iter().map(|&i| shards[i].clone()).collect();
            let recovered = reconstruct(&chosen).map_err(|e| format!("{subset:?}: {e}"))?;
            if recovered != secret {
                return Err(format!("{subset:?} reconstructed the wrong secret"));
            }
        }
        Ok(format!("{} subsets", subsets.len()))
    });
    result.add(step);

    let step = timed_step("below threshold is refused", || {
        let short = &shards[..shape.threshold - 1];
        match reconstruct(short) {
            Ok(_) if short.is_empty() => Err("empty share set accepted".into()),
            Ok(_) => Err(format!("{} shares reconstructed", short.len())),
            Err(e) => Ok(e.to_string()),
        }
    });
    result.add(step);

    let step = timed_step("duplicate index is refused", || {
        let doubled = vec![shards[0].clone(), shards[0].clone()];
        match reconstruct(&doubled) {
            Ok(_) => Err("duplicate shares accepted".into()),
            Err(e) => Ok(e.to_string()),
        }
    });
    result.add(step);

    result.finalize(start);
    Ok(result)
}

/// Every `k`-sized subset of `0..n`, in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(k);
    fn walk(from: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in from..n {
            current.push(i);
            walk(i + 1, n, k, current, out);
            current.pop();
        }
    }
    walk(0, n, k, &mut current, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinations_count() {
        assert_eq!(combinations(3, 2), vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
        assert_eq!(combinations(5, 3).len(), 10);
        assert_eq!(combinations(4, 4).len(), 1);
    }

    #[test]
    fn split_scenario_passes() {
        let shape = GroupShape {
            stewards: 3,
            threshold: 2,
        };
        let result = run(shape, b"K").unwrap();
        assert!(result.success(), "{:?}", result.steps);
    }
}
