//! Email variant selection for A/B tested steps.

use rand::Rng;
use tracing::debug;

use crate::types::EmailVariant;

/// Chooses the variant an enrollment receives.
///
/// A declared winner always wins. Otherwise a weighted draw is made from
/// the caller-supplied random source, so tests can seed it.
#[derive(Debug, Clone, Default)]
pub struct VariantSelector;

impl VariantSelector {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` only when `variants` is empty.
    pub fn select<'a, R: Rng + ?Sized>(
        &self,
        variants: &'a [EmailVariant],
        rng: &mut R,
    ) -> Option<&'a EmailVariant> {
        if let Some(winner) = variants.iter().find(|v| v.is_winner) {
            return Some(winner);
        }

        let total: u64 = variants.iter().map(|v| u64::from(v.weight)).sum();
        if total == 0 {
            return variants.first();
        }

        let draw = rng.gen_range(1..=total);
        let mut cumulative = 0u64;
        for variant in variants {
            cumulative += u64::from(variant.weight);
            if draw <= cumulative {
                debug!(variant_id = %variant.id, draw, total, "Variant selected");
                return Some(variant);
            }
        }
        variants.last()
    }
}
