// Re-export all items from the submodules
mod hunt_config;
mod rules;

pub use hunt_config::{load_or_create_config, HuntConfig};
pub use rules::{Accuracy, MatchRule, Relevance, RuleDescriptor, RuleSet, SearchLocation};
