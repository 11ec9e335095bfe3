//! Classify command implementation.

use super::{load_config, print_json};
use colored::Colorize;
use conductor_orchestrator::IntentClassifier;
use std::path::Path;

/// Execute the classify command.
pub fn execute(config: Option<&Path>, text: &str, json: bool) -> anyhow::Result<()> {
    let (config, _) = load_config(config)?;
    let classifier = IntentClassifier::from_config(&config.classifier)?;
    let intent = classifier.classify(text);

    if json {
        return print_json(&intent);
    }

    let category =
        if intent.is_unknown() { intent.category.yellow() } else { intent.category.cyan() };
    println!("{} {} ({:.2})", "Intent:".bold(), category, intent.confidence);
    for (name, value) in &intent.params {
        println!("  {} = {}", name, value);
    }
    if intent.is_unknown() {
        println!(
            "{}",
            format!("Below the confidence floor of {:.2}.", classifier.floor()).dimmed()
        );
    }
    Ok(())
}
