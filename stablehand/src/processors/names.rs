//! Foal name generation.

use rand::Rng;
use rand::rng;

/// Names newborn foals.
pub trait NameGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Generate a random racehorse-style name.
/// Format: "{adjective} {noun}"
/// Example: "Midnight Tempest"
pub struct RandomNameGenerator;

const ADJECTIVES: &[&str] = &[
    "Midnight",
    "Golden",
    "Thundering",
    "Silent",
    "Crimson",
    "Northern",
    "Velvet",
    "Iron",
    "Lucky",
    "Wild",
    "Royal",
    "Stormy",
    "Blazing",
    "Silver",
    "Daring",
];

const NOUNS: &[&str] = &[
    "Tempest",
    "Whisper",
    "Comet",
    "Dancer",
    "Arrow",
    "Ember",
    "Gallop",
    "Meadow",
    "Shadow",
    "Sovereign",
    "Zephyr",
    "Banner",
    "Harbor",
    "Legend",
    "Promise",
];

impl NameGenerator for RandomNameGenerator {
    fn generate(&self) -> String {
        let mut rng = rng();
        let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
        let noun = NOUNS[rng.random_range(0..NOUNS.len())];
        format!("{adjective} {noun}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_two_word_names() {
        let name = RandomNameGenerator.generate();
        let words: Vec<&str> = name.split(' ').collect();
        assert_eq!(words.len(), 2);
        assert!(ADJECTIVES.contains(&words[0]));
        assert!(NOUNS.contains(&words[1]));
    }
}
