use {
    super::*,
    crate::interval::KeyRange,
    serde_json::json,
};

fn id(s: &str) -> ShardId {
    ShardId::from(s)
}

fn assert_disjoint(strategy: &RangeStrategy) {
    let ranges = strategy.ranges();
    for (i, a) in ranges.iter().enumerate() {
        for b in ranges.iter().skip(i + 1) {
            assert!(
                !a.key_range().overlaps(b.key_range()),
                "{} overlaps {}",
                a.key_range(),
                b.key_range()
            );
        }
    }
}

#[test]
fn lookup() {
    let strategy = RangeStrategy::new();
    strategy.add_range(0, 10, &id("s1")).unwrap();
    strategy.add_range(10, 20, &id("s2")).unwrap();

    assert_eq!(strategy.resolve_for_key(&json!(0)).unwrap(), "s1");
    assert_eq!(strategy.resolve_for_key(&json!(9)).unwrap(), "s1");
    assert_eq!(strategy.resolve_for_key(&json!(10)).unwrap(), "s2");
    assert_eq!(strategy.resolve_for_key(&json!(20)).unwrap_err().code(), 1320);
    assert_eq!(strategy.resolve_for_key(&json!(-1)).unwrap_err().code(), 1320);
    assert_eq!(strategy.resolve_for_key(&json!(null)).unwrap_err().code(), 1310);
}

#[test]
fn overlap_rejected() {
    let strategy = RangeStrategy::new();
    strategy.add_range(0, 10, &id("s1")).unwrap();
    assert_eq!(strategy.add_range(5, 15, &id("s2")).unwrap_err().code(), 1320);
    assert_eq!(strategy.add_range(0, 10, &id("s2")).unwrap_err().code(), 1320);
    assert_eq!(strategy.ranges().len(), 1);
    assert!(!strategy.all_shards().contains(&id("s2")));

    let overlapping = RangeStrategy::with_ranges([
        (KeyRange::new(0, 10).unwrap(), id("s1")),
        (KeyRange::new(9, 20).unwrap(), id("s2")),
    ]);
    assert!(overlapping.is_err());
}

#[test]
fn split() {
    let strategy = RangeStrategy::new();
    strategy.add_range(0, 10, &id("s1")).unwrap();
    strategy.split_range(0, 5, &id("s3")).unwrap();

    assert_eq!(strategy.resolve_for_key(&json!(3)).unwrap(), "s1");
    assert_eq!(strategy.resolve_for_key(&json!(7)).unwrap(), "s3");
    assert_eq!(strategy.ranges().len(), 2);
    assert_disjoint(&strategy);

    // Split point must be strictly inside the interval.
    assert_eq!(strategy.split_range(0, 0, &id("s4")).unwrap_err().code(), 1320);
    assert_eq!(strategy.split_range(0, 5, &id("s4")).unwrap_err().code(), 1320);
    assert_eq!(strategy.split_range(50, 55, &id("s4")).unwrap_err().code(), 1320);
    assert_eq!(strategy.ranges().len(), 2);
}

#[test]
fn merge() {
    let strategy = RangeStrategy::new();
    strategy.add_range(0, 10, &id("s1")).unwrap();
    strategy.add_range(10, 20, &id("s2")).unwrap();
    strategy.add_range(30, 40, &id("s3")).unwrap();

    let first = KeyRange::new(0, 10).unwrap();
    let second = KeyRange::new(10, 20).unwrap();
    let gap = KeyRange::new(30, 40).unwrap();

    assert_eq!(strategy.merge_ranges(&second, &gap, &id("s9")).unwrap_err().code(), 1320);
    let missing = KeyRange::new(20, 30).unwrap();
    assert_eq!(strategy.merge_ranges(&second, &missing, &id("s9")).unwrap_err().code(), 1320);
    assert_eq!(strategy.ranges().len(), 3);

    strategy.merge_ranges(&first, &second, &id("s9")).unwrap();
    assert_eq!(strategy.resolve_for_key(&json!(5)).unwrap(), "s9");
    assert_eq!(strategy.resolve_for_key(&json!(15)).unwrap(), "s9");
    assert_eq!(strategy.ranges().len(), 2);
    assert_disjoint(&strategy);
}

#[test]
fn span_queries() {
    let strategy = RangeStrategy::new();
    strategy.add_range(0, 10, &id("s1")).unwrap();
    strategy.add_range(10, 20, &id("s2")).unwrap();
    strategy.add_range(20, 30, &id("s3")).unwrap();

    assert_eq!(strategy.shards_for_span(5, 15).unwrap(), vec![id("s1"), id("s2")]);
    assert_eq!(strategy.shards_for_span(10, 20).unwrap(), vec![id("s2")]);
    assert!(strategy.shards_for_span(30, 40).unwrap().is_empty());

    let criteria = json!({"id": 25});
    assert_eq!(
        strategy.resolve_for_query(criteria.as_object().unwrap()).unwrap(),
        vec![id("s3")]
    );
    let criteria = json!({"id": 99});
    assert!(strategy.resolve_for_query(criteria.as_object().unwrap()).unwrap().is_empty());
    let criteria = json!({"name": "x"});
    assert_eq!(strategy.resolve_for_query(criteria.as_object().unwrap()).unwrap().len(), 3);
    // Span-looking fields are plain filters, not a routing span.
    let criteria = json!({"start": 5, "end": 15});
    assert_eq!(strategy.resolve_for_query(criteria.as_object().unwrap()).unwrap().len(), 3);
}

#[test]
fn membership() {
    let strategy = RangeStrategy::new();
    strategy.add_shard(&id("s1")).unwrap();
    assert!(strategy.add_shard(&id("s1")).is_err());
    strategy.add_range(0, 10, &id("s1")).unwrap();
    strategy.add_range(10, 20, &id("s2")).unwrap();

    strategy.remove_shard(&id("s1")).unwrap();
    assert_eq!(strategy.all_shards(), vec![id("s2")]);
    assert_eq!(strategy.resolve_for_key(&json!(5)).unwrap_err().code(), 1320);
    assert!(strategy.remove_shard(&id("s1")).is_err());
}

#[test]
fn mutation_sequences_stay_disjoint() {
    let strategy = RangeStrategy::new();
    strategy.add_range(0, 1000, &id("s0")).unwrap();
    for (i, point) in [500, 250, 750, 125, 875].into_iter().enumerate() {
        let owner_start = strategy
            .ranges()
            .into_iter()
            .find(|interval| interval.key_range().contains(&ShardKey::Int(point)))
            .map(|interval| interval.key_range().start().clone())
            .unwrap();
        strategy
            .split_range(owner_start, point, &id(&format!("s{}", i + 1)))
            .unwrap();
        assert_disjoint(&strategy);
    }
    assert_eq!(strategy.ranges().len(), 6);

    let ranges = strategy.ranges();
    strategy
        .merge_ranges(ranges[0].key_range(), ranges[1].key_range(), &id("m"))
        .unwrap();
    assert_disjoint(&strategy);
    for key in 0..1000 {
        assert!(strategy.resolve_for_key(&json!(key)).is_ok());
    }
}
