use anyhow::Result;
use ironexec::expr::{SortOrder, col, ordering_satisfies};
use ironexec::partitioning::{Distribution, Partitioning};

fn clustered(keys: &[&str]) -> Distribution {
    Distribution::clustered(keys.iter().map(|k| col(*k)).collect())
}

#[test]
fn single_partition_satisfies_everything_but_broadcast() {
    let single = Partitioning::Single;
    assert!(single.satisfies(&Distribution::Unspecified));
    assert!(single.satisfies(&Distribution::AllTuples));
    assert!(single.satisfies(&clustered(&["a"])));
    assert!(single.satisfies(&Distribution::Ordered(vec![SortOrder::asc(col("a"))])));
    assert!(!single.satisfies(&Distribution::Broadcast));
}

#[test]
fn hash_partitioning_on_a_subset_of_keys_is_clustered() {
    let by_a = Partitioning::hash(vec![col("a")], 8);
    assert!(by_a.satisfies(&clustered(&["a"])));
    assert!(by_a.satisfies(&clustered(&["a", "b"])));
    assert!(!by_a.satisfies(&clustered(&["b"])));

    let by_ab = Partitioning::hash(vec![col("a"), col("b")], 8);
    assert!(!by_ab.satisfies(&clustered(&["a"])));
    assert!(!by_ab.satisfies(&Distribution::AllTuples));
}

#[test]
fn required_partition_count_must_match() {
    let p = Partitioning::hash(vec![col("a")], 8);
    let wants_four = Distribution::Clustered {
        keys: vec![col("a")],
        required_num_partitions: Some(4),
    };
    assert!(!p.satisfies(&wants_four));
    assert!(Partitioning::hash(vec![col("a")], 4).satisfies(&wants_four));
}

#[test]
fn unknown_and_round_robin_only_meet_unspecified() {
    for p in [Partitioning::Unknown(3), Partitioning::RoundRobin(3)] {
        assert!(p.satisfies(&Distribution::Unspecified));
        assert!(!p.satisfies(&clustered(&["a"])));
        assert!(!p.satisfies(&Distribution::AllTuples));
    }
    assert!(Partitioning::Unknown(1).satisfies(&Distribution::AllTuples));
}

#[test]
fn range_partitioning_orders_and_clusters() {
    let range = Partitioning::range(vec![SortOrder::asc(col("a")), SortOrder::asc(col("b"))], 4);
    assert!(range.satisfies(&Distribution::Ordered(vec![SortOrder::asc(col("a"))])));
    assert!(!range.satisfies(&Distribution::Ordered(vec![SortOrder::desc(col("a"))])));
    assert!(range.satisfies(&clustered(&["a", "b", "c"])));
    assert!(!range.satisfies(&clustered(&["a"])));
}

#[test]
fn broadcast_only_meets_broadcast() {
    assert!(Partitioning::Broadcast.satisfies(&Distribution::Broadcast));
    assert!(!Partitioning::Broadcast.satisfies(&Distribution::AllTuples));
    assert!(!Partitioning::hash(vec![col("a")], 1).satisfies(&Distribution::Broadcast));
}

#[test]
fn guarantees_requires_a_real_promise() {
    let a = Partitioning::hash(vec![col("a")], 4);
    assert!(a.guarantees(&a.clone()));
    assert!(a.compatible_with(&Partitioning::hash(vec![col("a")], 4)));
    assert!(!a.guarantees(&Partitioning::hash(vec![col("a")], 8)));
    assert!(!Partitioning::Unknown(4).guarantees(&Partitioning::Unknown(4)));
    assert!(!Partitioning::RoundRobin(2).guarantees(&Partitioning::RoundRobin(2)));
    assert!(Partitioning::Single.guarantees(&Partitioning::hash(vec![col("a")], 1)));
    assert!(!Partitioning::Single.guarantees(&Partitioning::Broadcast));
}

#[test]
fn create_partitioning_picks_the_canonical_layout() -> Result<()> {
    assert_eq!(Distribution::AllTuples.create_partitioning(7)?, Partitioning::Single);
    assert_eq!(
        clustered(&["k"]).create_partitioning(7)?,
        Partitioning::hash(vec![col("k")], 7)
    );
    let pinned = Distribution::Clustered {
        keys: vec![col("k")],
        required_num_partitions: Some(3),
    };
    assert_eq!(pinned.create_partitioning(7)?.num_partitions(), 3);
    let order = vec![SortOrder::asc(col("k"))];
    assert_eq!(
        Distribution::Ordered(order.clone()).create_partitioning(5)?,
        Partitioning::range(order, 5)
    );
    assert_eq!(Distribution::Broadcast.create_partitioning(5)?, Partitioning::Broadcast);
    assert!(Distribution::Unspecified.create_partitioning(5).is_err());
    Ok(())
}

#[test]
fn created_partitioning_satisfies_its_distribution() -> Result<()> {
    let distributions = [
        Distribution::AllTuples,
        clustered(&["a", "b"]),
        Distribution::Ordered(vec![SortOrder::desc(col("a"))]),
        Distribution::Broadcast,
    ];
    for d in &distributions {
        assert!(d.create_partitioning(6)?.satisfies(d), "{d}");
    }
    Ok(())
}

#[test]
fn key_positions_line_up_join_sides() {
    let left = Partitioning::hash(vec![col("b"), col("a")], 4);
    assert_eq!(left.key_positions(&[col("a"), col("b")]), Some(vec![1, 0]));
    assert_eq!(left.key_positions(&[col("a")]), None);
    assert_eq!(Partitioning::Single.key_positions(&[col("a")]), None);
}

#[test]
fn ordering_prefix_rule() {
    let a = SortOrder::asc(col("a"));
    let b = SortOrder::asc(col("b"));
    assert!(ordering_satisfies(&[a.clone(), b.clone()], &[a.clone()]));
    assert!(!ordering_satisfies(&[b.clone(), a.clone()], &[a.clone(), b.clone()]));
    assert!(!ordering_satisfies(&[a.clone()], &[a.clone(), b]));
    assert!(ordering_satisfies(&[], &[]));
    assert!(!ordering_satisfies(&[SortOrder::desc(col("a"))], &[a]));
}

#[test]
fn display_names() {
    assert_eq!(
        Partitioning::hash(vec![col("a"), col("b")], 4).to_string(),
        "hashpartitioning(a, b, 4)"
    );
    assert_eq!(Partitioning::Single.to_string(), "SinglePartition");
    assert_eq!(clustered(&["a"]).to_string(), "ClusteredDistribution(a)");
}
