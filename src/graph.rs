use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, bail};

use crate::pipeline::StageSpec;

/// Compute the execution order of `specs` from their `needs` edges.
///
/// Ties are broken by declaration order so the same buildfile always runs its
/// stages in the same sequence. Returns indices into `specs`.
pub fn plan_order(specs: &[StageSpec]) -> Result<Vec<usize>> {
    let mut index_by_name: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        if index_by_name.insert(spec.name.as_str(), idx).is_some() {
            bail!("Duplicate stage name '{}'", spec.name);
        }
    }

    let mut in_degree = vec![0usize; specs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (idx, spec) in specs.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for need in &spec.needs {
            let Some(&dep) = index_by_name.get(need.as_str()) else {
                bail!("Stage '{}' needs unknown stage '{}'", spec.name, need);
            };
            if dep == idx {
                bail!("Stage '{}' cannot depend on itself", spec.name);
            }
            if seen.insert(dep) {
                in_degree[idx] += 1;
                dependents[dep].push(idx);
            }
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter_map(|(idx, degree)| (*degree == 0).then_some(idx))
        .collect();
    let mut order = Vec::with_capacity(specs.len());

    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &dependents[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != specs.len() {
        let mut stuck: Vec<_> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(idx, _)| specs[idx].name.as_str())
            .collect();
        stuck.sort_unstable();
        bail!("Stage dependency cycle detected between: {}", stuck.join(", "));
    }

    Ok(order)
}
