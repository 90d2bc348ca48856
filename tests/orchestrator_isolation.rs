// =============================================================================
// Multi-symbol isolation — per-symbol strategies are never shared
// =============================================================================
//
// The factory hands every loop brand-new strategy instances. Mutating the
// internal state of one instance must not affect any other, including under
// concurrent creation.
// =============================================================================

use meridian_bot::strategy::{Strategy, StrategyFactory};

#[test]
fn factory_instances_are_pairwise_distinct() {
    let symbols = ["BTCUSDT", "ETHUSDT", "XRPUSDT"];
    let per_symbol: Vec<Vec<Box<dyn Strategy>>> =
        symbols.iter().map(|_| StrategyFactory::create_all()).collect();

    let mut addresses = Vec::new();
    for set in &per_symbol {
        assert_eq!(set.len(), 3);
        for strategy in set {
            let addr = strategy.as_ref() as *const dyn Strategy as *const () as usize;
            assert!(
                !addresses.contains(&addr),
                "strategy instance shared between symbols"
            );
            addresses.push(addr);
        }
    }
    assert_eq!(addresses.len(), symbols.len() * 3);
}

#[test]
fn mutating_one_instance_does_not_leak() {
    let mut set_a = StrategyFactory::create_all();
    let set_b = StrategyFactory::create_all();

    // Flip every strategy in set A on; set B stays untouched.
    for strategy in set_a.iter_mut() {
        strategy.set_enabled(true);
    }
    for strategy in &set_a {
        assert!(strategy.is_enabled());
    }
    for strategy in &set_b {
        assert!(!strategy.is_enabled(), "state leaked across factory calls");
    }
}

#[test]
fn concurrent_creation_yields_distinct_objects() {
    let threads = 8;
    let per_thread = 5;

    // Keep every instance alive until all addresses are compared, so the
    // allocator cannot reuse a freed slot and fake a duplicate.
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            std::thread::spawn(move || {
                (0..per_thread)
                    .map(|_| StrategyFactory::create_all())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut sets: Vec<Vec<Box<dyn Strategy>>> = Vec::new();
    for handle in handles {
        sets.extend(handle.join().unwrap());
    }

    let mut all: Vec<usize> = sets
        .iter()
        .flat_map(|set| {
            set.iter()
                .map(|s| s.as_ref() as *const dyn Strategy as *const () as usize)
        })
        .collect();

    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), total, "duplicate instance addresses across threads");
    assert_eq!(total, threads * per_thread * 3);
}
