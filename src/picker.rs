use anyhow::{Context, Result};
use clap::ValueEnum;
use dialoguer::FuzzySelect;
use dialoguer::theme::ColorfulTheme;

use crate::probe::ProbeKind;

/// Show a fuzzy picker over every probe kind.
pub fn pick_probe() -> Result<ProbeKind> {
    let kinds = ProbeKind::value_variants();
    let items: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
    let index = pick("Probe", &items)?;
    Ok(kinds[index])
}

/// Show a fuzzy picker and return the selected item's index.
fn pick(prompt: &str, items: &[String]) -> Result<usize> {
    if items.is_empty() {
        anyhow::bail!("nothing to choose from");
    }

    FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(items)
        .interact()
        .context("selection cancelled")
}
