/// Scheduling keys of one node. Forward keys run `0..N`; gradient keys count
/// down from `3N - 2` in steps of two so that backward visits later nodes
/// first, and each derivative key directly follows its gradient key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExecutionOrder {
    pub forward: usize,
    pub gradient: usize,
    pub derivative: usize,
}

#[must_use]
pub fn execution_order(position: usize, count: usize) -> ExecutionOrder {
    let gradient = 3 * count - 2 * (position + 1);
    ExecutionOrder {
        forward: position,
        gradient,
        derivative: gradient + 1,
    }
}

/// Keys for every position of a sorted graph of `count` nodes.
#[must_use]
pub fn assign_execution_order(count: usize) -> Vec<ExecutionOrder> {
    (0..count)
        .map(|position| execution_order(position, count))
        .collect()
}
