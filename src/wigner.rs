//! Wigner 3j symbols by three-term recursion.
//!
//! The mode-coupling kernel needs `(l1 l2 l3; s -s 0)` for every
//! `l3` at fixed `(l1, l2)`. [`wigner3j_range`] computes the whole
//! family in one sweep of the Schulten-Gordon recursion, normalized
//! with the `Σ (2j+1) f² = 1` sum rule and the standard endpoint sign
//! rule. Accuracy degrades in the deep classically-forbidden tails
//! for very large quantum numbers, where the symbols are negligible.

/// All symbols `f(j1) = (j1 j2 j3; m1 m2 m3)` with `m1 = -(m2+m3)`,
/// for `j1` from the returned minimum to `j2 + j3`.
pub fn wigner3j_range(j2: u32, j3: u32, m2: i32, m3: i32) -> (u32, Vec<f64>) {
    let (j2i, j3i) = (j2 as i64, j3 as i64);
    let (m2i, m3i) = (m2 as i64, m3 as i64);
    let m1 = -(m2i + m3i);
    if m2i.abs() > j2i || m3i.abs() > j3i {
        return (0, Vec::new());
    }

    let j1min = (j2i - j3i).abs().max(m1.abs()) as u32;
    let j1max = j2 + j3;
    let n = (j1max - j1min) as usize + 1;

    if n == 1 {
        let magnitude = 1.0 / ((2 * j1min + 1) as f64).sqrt();
        let sign = if (j2i - j3i + m2i + m3i).rem_euclid(2) == 0 {
            1.0
        } else {
            -1.0
        };
        return (j1min, vec![sign * magnitude]);
    }

    let a = |j: f64| -> f64 {
        let d = j2i - j3i;
        let s = j2i + j3i + 1;
        ((j * j - (d * d) as f64) * ((s * s) as f64 - j * j) * (j * j - (m1 * m1) as f64)).sqrt()
    };
    let y = |j: f64| -> f64 {
        (2.0 * j + 1.0)
            * (m1 as f64 * ((j2i * (j2i + 1) - j3i * (j3i + 1)) as f64)
                + (m3i - m2i) as f64 * j * (j + 1.0))
    };

    let mut f = Vec::with_capacity(n);
    let exact_seeds = j1min == 0;
    if exact_seeds {
        // j1min = 0 forces j2 = j3 and m1 = 0; both seeds have closed
        // forms: (0 j j; 0 m -m) and (1 j j; 0 m -m)
        let j = j2i as f64;
        let m = m2i as f64;
        let sign = if (j2i - m2i).rem_euclid(2) == 0 {
            1.0
        } else {
            -1.0
        };
        f.push(sign / (2.0 * j + 1.0).sqrt());
        f.push(sign * m / (j * (j + 1.0) * (2.0 * j + 1.0)).sqrt());
    } else {
        f.push(1.0);
    }

    // upward recursion with overflow rescaling; the first step of a
    // nondegenerate start has a vanishing f(j1min - 1) coefficient
    while f.len() < n {
        let k = f.len();
        let j = (j1min as usize + k - 1) as f64;
        let prev2 = if k >= 2 { f[k - 2] } else { 0.0 };
        let next = -(y(j) * f[k - 1] + (j + 1.0) * a(j) * prev2) / (j * a(j + 1.0));
        f.push(next);
        if next.abs() > 1e250 {
            for v in f.iter_mut() {
                *v /= 1e250;
            }
        }
    }

    // normalize with the sum rule
    let norm: f64 = f
        .iter()
        .enumerate()
        .map(|(k, v)| (2 * (j1min as usize + k) + 1) as f64 * v * v)
        .sum();
    let mut scale = 1.0 / norm.sqrt();

    // fix the global sign from the endpoint unless the seeds were
    // already exact
    if !exact_seeds {
        let expected_negative = (j2i - j3i + m2i + m3i).rem_euclid(2) != 0;
        let last = f[n - 1];
        if (last < 0.0) != expected_negative {
            scale = -scale;
        }
    }
    for v in f.iter_mut() {
        *v *= scale;
    }

    (j1min, f)
}
