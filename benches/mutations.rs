use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use tikv_txn::mock::MockCluster;
use tikv_txn::mock::MockEnv;
use tikv_txn::mock::MockOracle;
use tikv_txn::region::RegionVerId;
use tikv_txn::store::Op;
use tikv_txn::transaction::key_value_size;
use tikv_txn::transaction::split_into_batches;
use tikv_txn::transaction::GroupedMutations;
use tikv_txn::transaction::MutationSet;
use tikv_txn::Key;

fn mutations(n: usize, value_len: usize) -> MutationSet {
    let mut set = MutationSet::with_capacity(n);
    for i in 0..n {
        let key = Key::from(format!("key{i:08}"));
        set.push(Op::Put, key, vec![0_u8; value_len], false);
    }
    set
}

fn bench_split_into_batches(c: &mut Criterion) {
    let group = GroupedMutations {
        region: RegionVerId {
            id: 1,
            conf_ver: 1,
            ver: 1,
        },
        mutations: mutations(10_000, 64),
    };
    let primary = Key::from(format!("key{:08}", 5_000));
    c.bench_function("mutations/split_10k_into_16k_batches", |b| {
        b.iter(|| {
            let batches = split_into_batches(
                black_box(group.clone()),
                &primary,
                key_value_size,
                16 * 1024,
            );
            black_box(batches.len())
        })
    });
}

fn bench_commit_across_regions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    c.bench_function("commit/100_keys_4regions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let cluster = MockCluster::with_splits(["key00000025", "key00000050", "key00000075"]);
                let env = MockEnv::new(cluster, MockOracle::new());
                let mut txn = env.client().begin_optimistic().await.expect("begin");
                for i in 0..100 {
                    txn.put(format!("key{i:08}"), vec![1_u8; 16])
                        .await
                        .expect("put");
                }
                let commit_ts = txn.commit().await.expect("commit");
                txn.wait_background_tasks().await;
                black_box(commit_ts)
            })
        })
    });
}

criterion_group!(benches, bench_split_into_batches, bench_commit_across_regions);
criterion_main!(benches);
