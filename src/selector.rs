//! Weighted selection of test variants.
use rand::{rngs::OsRng, rngs::StdRng, Rng, RngCore, SeedableRng};

/// Weights whose sum is further than this from 1 are considered invalid.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Return weights usable for `variant_count` variants.
///
/// Weights that are missing, not aligned 1:1 with the variants, negative/non-finite, or that do
/// not sum to 1 are replaced by a uniform distribution.
pub fn normalize_weights(variant_count: usize, weights: Option<&[f64]>) -> Vec<f64> {
    match weights {
        Some(weights) if are_valid_weights(variant_count, weights) => weights.to_vec(),
        _ => vec![1.0 / variant_count as f64; variant_count],
    }
}

fn are_valid_weights(variant_count: usize, weights: &[f64]) -> bool {
    weights.len() == variant_count
        && weights.iter().all(|w| w.is_finite() && *w >= 0.0)
        && (weights.iter().sum::<f64>() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE
}

/// Pick a variant at random according to `weights`.
///
/// Randomness comes from the operating system's secure generator. If it is unavailable, a
/// clock-seeded generator is used instead.
///
/// Returns `None` only if `variants` is empty.
pub fn select<'a, S: AsRef<str>>(variants: &'a [S], weights: Option<&[f64]>) -> Option<&'a str> {
    let r = draw_unit();
    select_at(variants, weights, r)
}

/// Same as [`select`] but draws from the provided random number generator.
pub fn select_with_rng<'a, S: AsRef<str>, R: Rng>(
    variants: &'a [S],
    weights: Option<&[f64]>,
    rng: &mut R,
) -> Option<&'a str> {
    let r = rng.gen::<f64>();
    select_at(variants, weights, r)
}

/// Pick the variant with the strictly greatest weight. Ties go to the first variant.
///
/// Used when variants must not be randomized (e.g., the user has not given storage consent).
pub fn select_deterministic<'a, S: AsRef<str>>(
    variants: &'a [S],
    weights: Option<&[f64]>,
) -> Option<&'a str> {
    let weights = normalize_weights(variants.len(), weights);

    let mut best: Option<(usize, f64)> = None;
    for (i, weight) in weights.iter().copied().enumerate() {
        match best {
            Some((_, best_weight)) if weight <= best_weight => {}
            _ => best = Some((i, weight)),
        }
    }

    best.map(|(i, _)| variants[i].as_ref())
}

fn select_at<'a, S: AsRef<str>>(
    variants: &'a [S],
    weights: Option<&[f64]>,
    r: f64,
) -> Option<&'a str> {
    let last = variants.last()?;
    let weights = normalize_weights(variants.len(), weights);

    let mut cumulative = 0.0;
    for (variant, weight) in variants.iter().zip(weights) {
        cumulative += weight;
        if cumulative >= r {
            return Some(variant.as_ref());
        }
    }

    // Floating point error may leave the cumulative sum slightly below `r`.
    Some(last.as_ref())
}

/// Draw a uniform scalar in `[0, 1)`.
fn draw_unit() -> f64 {
    let mut bytes = [0u8; 8];
    match OsRng.try_fill_bytes(&mut bytes) {
        // 53 random bits give every representable multiple of 2^-53 in [0, 1).
        Ok(()) => (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64,
        Err(err) => {
            log::debug!(target: "abby", "secure random source unavailable, using fallback: {err}");
            let seed = chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default() as u64;
            StdRng::seed_from_u64(seed).gen::<f64>()
        }
    }
}
