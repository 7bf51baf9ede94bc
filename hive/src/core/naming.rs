//! Deterministic, tier-based worker name generation.

/// Default tiers: short names are handed out before longer ones.
pub const DEFAULT_TIERS: &[&[&str]] = &[
    &["ada", "bee", "cog", "dot", "elm", "fig", "gem", "hex"],
    &["amber", "basil", "cedar", "delta", "ember", "flint", "grove", "heron"],
    &["anchor", "beacon", "cobalt", "dynamo", "falcon", "harbor", "lantern", "meteor"],
];

/// Issues names in tier order, skipping names the caller reports as taken.
///
/// Given the same tiers and the same sequence of `is_taken` answers the
/// generator yields the same names. Once every tier is exhausted, names are
/// reissued with a numeric round suffix (`ada-2`, `bee-2`, ...).
#[derive(Debug, Clone)]
pub struct NameGenerator {
    names: Vec<String>,
    cursor: usize,
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new(
            DEFAULT_TIERS
                .iter()
                .map(|tier| tier.iter().map(|name| name.to_string()).collect())
                .collect(),
        )
    }
}

impl NameGenerator {
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        let mut names: Vec<String> = tiers.into_iter().flatten().collect();
        if names.is_empty() {
            names.push("worker".to_string());
        }
        Self { names, cursor: 0 }
    }

    pub fn next_name<F: Fn(&str) -> bool>(&mut self, is_taken: F) -> String {
        loop {
            let candidate = self.candidate(self.cursor);
            self.cursor += 1;
            if !is_taken(&candidate) {
                return candidate;
            }
        }
    }

    fn candidate(&self, position: usize) -> String {
        let base = &self.names[position % self.names.len()];
        let round = position / self.names.len();
        if round == 0 {
            base.clone()
        } else {
            format!("{base}-{}", round + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|tier| tier.iter().map(|name| name.to_string()).collect())
            .collect()
    }

    #[test]
    fn lower_tier_exhausted_first() {
        let mut names = NameGenerator::new(tiers(&[&["a", "b"], &["long"]]));
        let issued: Vec<_> = (0..3).map(|_| names.next_name(|_| false)).collect();
        assert_eq!(issued, vec!["a", "b", "long"]);
    }

    #[test]
    fn taken_names_are_skipped() {
        let mut names = NameGenerator::new(tiers(&[&["a", "b", "c"]]));
        assert_eq!(names.next_name(|name| name == "a"), "b");
        assert_eq!(names.next_name(|_| false), "c");
    }

    #[test]
    fn exhausted_tiers_get_round_suffix() {
        let mut names = NameGenerator::new(tiers(&[&["a"]]));
        assert_eq!(names.next_name(|_| false), "a");
        assert_eq!(names.next_name(|_| false), "a-2");
        assert_eq!(names.next_name(|_| false), "a-3");
    }

    #[test]
    fn same_spawn_order_same_names() {
        let mut first = NameGenerator::default();
        let mut second = NameGenerator::default();
        for _ in 0..30 {
            assert_eq!(first.next_name(|_| false), second.next_name(|_| false));
        }
    }
}
