/// Kullback-Leibler divergence between two discrete distributions, ignoring
/// states where either distribution has zero mass.
pub(crate) fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    p.iter()
        .zip(q.iter())
        .map(|(&a, &b)| if a > 0.0 && b > 0.0 { a * (a / b).ln() } else { 0.0 })
        .sum()
}

pub(crate) fn symmetric_kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    kl_divergence(p, q) + kl_divergence(q, p)
}

const MAX_ITERATIONS: usize = 100;

/// Partition `points` into `k` clusters around medoids, which are always
/// actual points. Deterministic: the first medoid is the most central point,
/// further medoids are chosen farthest-first, and the assign/update loop
/// breaks ties towards lower indices.
pub(crate) fn k_medoids<F>(points: &[Vec<f64>], k: usize, distance: F) -> Vec<Vec<usize>>
where
    F: Fn(&[f64], &[f64]) -> f64,
{
    assert!(k > 0);
    let n = points.len();
    if n <= k {
        return (0..n).map(|i| vec![i]).collect();
    }
    let dist = |i: usize, j: usize| distance(&points[i], &points[j]);

    let mut medoids = Vec::with_capacity(k);
    let central = (0..n)
        .min_by(|&a, &b| {
            let da: f64 = (0..n).map(|j| dist(a, j)).sum();
            let db: f64 = (0..n).map(|j| dist(b, j)).sum();
            da.partial_cmp(&db).unwrap().then(a.cmp(&b))
        })
        .unwrap();
    medoids.push(central);
    while medoids.len() < k {
        let farthest = (0..n)
            .filter(|i| !medoids.contains(i))
            .max_by(|&a, &b| {
                let da = medoids.iter().map(|&m| dist(a, m)).fold(f64::MAX, f64::min);
                let db = medoids.iter().map(|&m| dist(b, m)).fold(f64::MAX, f64::min);
                da.partial_cmp(&db).unwrap().then(b.cmp(&a))
            })
            .unwrap();
        medoids.push(farthest);
    }

    let mut assignment = vec![0usize; n];
    for _ in 0..MAX_ITERATIONS {
        // Assign each point to its nearest medoid.
        for (i, slot) in assignment.iter_mut().enumerate() {
            *slot = medoids
                .iter()
                .enumerate()
                .min_by(|(_, &ma), (_, &mb)| {
                    dist(i, ma).partial_cmp(&dist(i, mb)).unwrap().then(ma.cmp(&mb))
                })
                .map(|(cluster, _)| cluster)
                .unwrap();
        }
        // Update each medoid to the member minimising intra-cluster distance.
        let mut changed = false;
        for cluster in 0..k {
            let members: Vec<usize> = (0..n).filter(|&i| assignment[i] == cluster).collect();
            if members.is_empty() {
                continue;
            }
            let best = members
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    let da: f64 = members.iter().map(|&j| dist(a, j)).sum();
                    let db: f64 = members.iter().map(|&j| dist(b, j)).sum();
                    da.partial_cmp(&db).unwrap().then(a.cmp(&b))
                })
                .unwrap();
            if medoids[cluster] != best {
                medoids[cluster] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut clusters = vec![Vec::new(); k];
    for (i, &cluster) in assignment.iter().enumerate() {
        clusters[cluster].push(i);
    }
    // A cluster can end up empty when medoids coincide; reseed it with the
    // point farthest from every remaining medoid so callers always get k
    // non-degenerate groups.
    for cluster in 0..k {
        if clusters[cluster].is_empty() {
            let donor = (0..n)
                .filter(|i| clusters.iter().any(|c| c.len() > 1 && c.contains(i)))
                .max_by(|&a, &b| {
                    let da = medoids.iter().map(|&m| dist(a, m)).fold(f64::MAX, f64::min);
                    let db = medoids.iter().map(|&m| dist(b, m)).fold(f64::MAX, f64::min);
                    da.partial_cmp(&db).unwrap().then(b.cmp(&a))
                });
            if let Some(donor) = donor {
                clusters.iter_mut().for_each(|c| c.retain(|&i| i != donor));
                clusters[cluster].push(donor);
            }
        }
    }
    clusters
}
