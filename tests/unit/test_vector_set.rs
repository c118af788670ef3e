use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use vectorset::hnsw::QuantMode;
use vectorset::vset::{IdentityRegistry, IndexParams, VectorSet};

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    1.0 - dot / (na * nb)
}

fn build(quant: QuantMode, vectors: &[Vec<f32>]) -> VectorSet {
    let registry = IdentityRegistry::new();
    let set = VectorSet::with_params(
        vectors[0].len(),
        quant,
        None,
        IndexParams::default(),
        &registry,
    );
    for (i, v) in vectors.iter().enumerate() {
        set.insert(format!("v{i}").as_bytes(), v, true, 200);
    }
    set
}

#[test]
fn exact_vectors_are_found_at_zero_distance() {
    let vectors = random_vectors(400, 24, 7);
    for quant in [QuantMode::F32, QuantMode::Q8] {
        let set = build(quant, &vectors);
        assert_eq!(set.len(), 400);
        for i in (0..400).step_by(37) {
            let hits = set.search(&vectors[i], 100);
            assert_eq!(&*hits[0].payload, format!("v{i}").as_bytes());
            assert!(hits[0].distance < 0.02, "{quant:?} distance {}", hits[0].distance);
        }
    }
}

#[test]
fn recall_against_brute_force() {
    let vectors = random_vectors(1000, 16, 99);
    let queries = random_vectors(20, 16, 100);
    let set = build(QuantMode::F32, &vectors);

    let mut found = 0usize;
    for q in &queries {
        let mut exact: Vec<(f32, usize)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (cosine_distance(q, v), i))
            .collect();
        exact.sort_by(|a, b| a.0.total_cmp(&b.0));
        let truth: HashSet<Vec<u8>> = exact[..10]
            .iter()
            .map(|(_, i)| format!("v{i}").into_bytes())
            .collect();

        let hits = set.search(q, 200);
        found += hits
            .iter()
            .take(10)
            .filter(|n| truth.contains(&n.payload.to_vec()))
            .count();
    }
    let recall = found as f64 / (queries.len() * 10) as f64;
    assert!(recall >= 0.9, "recall {recall}");
}

#[test]
fn removals_never_surface_in_results() {
    let vectors = random_vectors(300, 8, 5);
    let set = build(QuantMode::Q8, &vectors);
    for i in (0..300).step_by(3) {
        assert!(set.remove(format!("v{i}").as_bytes()));
    }
    assert_eq!(set.len(), 200);
    assert_eq!(set.index().len(), 200);
    for q in vectors.iter().step_by(10) {
        for hit in set.search(q, 100) {
            let label = String::from_utf8(hit.payload.to_vec()).unwrap();
            let i: usize = label[1..].parse().unwrap();
            assert_ne!(i % 3, 0, "removed element {label} returned");
        }
    }
}

#[test]
fn concurrent_readers_with_a_writer() {
    let vectors = random_vectors(200, 12, 3);
    let set = Arc::new(build(QuantMode::Q8, &vectors[..100]));

    let readers: Vec<_> = (0..4)
        .map(|t| {
            let set = set.clone();
            let queries = random_vectors(50, 12, 1000 + t);
            std::thread::spawn(move || {
                for q in &queries {
                    let hits = set.search(q, 50);
                    assert!(!hits.is_empty());
                    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
                }
            })
        })
        .collect();

    for (i, v) in vectors.iter().enumerate().skip(100) {
        set.insert(format!("v{i}").as_bytes(), v, true, 100);
    }
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(set.len(), 200);
}

#[test]
fn binary_quantization_keeps_sign_neighbors_close() {
    let set = build(
        QuantMode::Bin,
        &[
            vec![1.0, 1.0, 1.0, 1.0],
            vec![-1.0, -1.0, -1.0, -1.0],
            vec![1.0, 1.0, -1.0, -1.0],
        ],
    );
    let hits = set.search(&[0.9, 0.8, 0.7, 0.6], 10);
    assert_eq!(&*hits[0].payload, b"v0");
    assert!(hits[0].distance.abs() < 1e-6);
    let last = hits.last().unwrap();
    assert_eq!(&*last.payload, b"v1");
    assert!((last.distance - 2.0).abs() < 1e-6);
}
