#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use fiber_executive::{HazardEntry, HazardStack};
use libfuzzer_sys::fuzz_target;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum HazardOperation {
    PushOwned,
    PushShared,
    Pop { execute: bool },
    PopIfTop { back: u8, execute: bool },
    Purge,
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let operations: Result<Vec<HazardOperation>, _> = (0..64)
        .map(|_| HazardOperation::arbitrary(&mut u))
        .collect();

    if let Ok(ops) = operations {
        fuzz_hazard_stack(ops);
    }
});

fn fuzz_hazard_stack(ops: Vec<HazardOperation>) {
    let stack = HazardStack::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let shared: Arc<dyn fiber_executive::Hazard> = {
        let runs = runs.clone();
        Arc::new(move || {
            runs.fetch_add(1, Ordering::Relaxed);
        })
    };

    // Model: ids currently on the stack, bottom first.
    let mut ids = Vec::new();
    let mut expected_runs = 0;

    for op in ops {
        match op {
            HazardOperation::PushOwned => {
                let runs = runs.clone();
                ids.push(stack.push(HazardEntry::owned(move || {
                    runs.fetch_add(1, Ordering::Relaxed);
                })));
            }
            HazardOperation::PushShared => {
                ids.push(stack.push(HazardEntry::shared(shared.clone())));
            }
            HazardOperation::Pop { execute } => {
                let popped = stack.pop(execute);
                assert_eq!(popped, ids.pop().is_some());
                if popped && execute {
                    expected_runs += 1;
                }
            }
            HazardOperation::PopIfTop { back, execute } => {
                if ids.is_empty() {
                    continue;
                }
                let index = ids.len() - 1 - (back as usize % ids.len());
                let id = ids[index];
                let popped = stack.pop_if_top(id, execute);
                assert_eq!(popped, index == ids.len() - 1);
                if popped {
                    ids.pop();
                    if execute {
                        expected_runs += 1;
                    }
                }
            }
            HazardOperation::Purge => {
                assert_eq!(stack.purge(), ids.len());
                expected_runs += ids.len();
                ids.clear();
            }
        }
        assert_eq!(stack.len(), ids.len());
        assert_eq!(runs.load(Ordering::Relaxed), expected_runs);
    }
}
