use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cyanea_core::Versioned;
use cyanea_phylo::{nucleotide_state, JukesCantor, PatternSet, SiteModel, TimeTree, TreeLikelihood};

fn balanced_newick(leaves: usize) -> String {
    fn build(lo: usize, hi: usize, height: f64) -> (String, f64) {
        if hi - lo == 1 {
            return (format!("t{}", lo), 0.0);
        }
        let mid = (lo + hi) / 2;
        let (l, lh) = build(lo, mid, height * 0.8);
        let (r, rh) = build(mid, hi, height * 0.8);
        (
            format!("({}:{},{}:{})", l, height - lh, r, height - rh),
            height,
        )
    }
    let (s, _) = build(0, leaves, 1.0);
    format!("{};", s)
}

fn random_alignment(taxa: usize, sites: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut state = seed;
    (0..taxa)
        .map(|_| {
            (0..sites)
                .map(|_| {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    b"ACGT"[(state >> 62) as usize]
                })
                .collect()
        })
        .collect()
}

fn setup(leaves: usize, sites: usize) -> (TimeTree, TreeLikelihood) {
    let tree = TimeTree::from_newick("bench", &balanced_newick(leaves)).unwrap();
    let names: Vec<String> = (0..leaves).map(|i| format!("t{}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let rows = random_alignment(leaves, sites, 42);
    let row_refs: Vec<&[u8]> = rows.iter().map(|r| r.as_slice()).collect();
    let data = PatternSet::from_sequences(4, &name_refs, &row_refs, nucleotide_state).unwrap();
    let lik = TreeLikelihood::new(
        &tree,
        &data,
        Box::new(JukesCantor::nucleotide()),
        SiteModel::gamma(0.5, 4).unwrap(),
    )
    .unwrap();
    (tree, lik)
}

fn bench_full(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_likelihood");

    let (tree, mut lik) = setup(64, 1000);
    group.bench_function("full_64x1000", |b| {
        b.iter(|| {
            lik.force_full_update();
            lik.calculate(black_box(&tree), 1.0).unwrap()
        })
    });

    let (mut tree, mut lik) = setup(64, 1000);
    lik.calculate(&tree, 1.0).unwrap();
    tree.commit();
    let node = tree.parent(0).unwrap();
    let base = tree.height(node);
    group.bench_function("single_height_64x1000", |b| {
        b.iter(|| {
            lik.store();
            tree.set_height(node, base * 0.99).unwrap();
            let lnl = lik.calculate(black_box(&tree), 1.0).unwrap();
            tree.rollback();
            lik.restore();
            lnl
        })
    });

    group.finish();
}

criterion_group!(benches, bench_full);
criterion_main!(benches);
