//! Praise template catalog and per-identity non-repeating rotation.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

use crate::RotationHistory;

pub const NAME_PLACEHOLDER: &str = "{name}";
pub const AMOUNT_PLACEHOLDER: &str = "{amount}";

pub const CATALOG_VERSION: u32 = 1;

const BUILTIN_CATALOG: &str = include_str!("../templates/praise.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateCatalog {
    version: u32,
    styles: Vec<TemplateStyle>,
    #[serde(default)]
    schedule: Vec<StyleOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateStyle {
    pub name: String,
    pub templates: Vec<String>,
}

/// A style that runs alone until `until` (exclusive).
#[derive(Debug, Clone, Deserialize)]
pub struct StyleOverride {
    pub style: String,
    pub until: NaiveDate,
}

impl TemplateCatalog {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG).context("parsing built-in template catalog")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        if self.version != CATALOG_VERSION {
            bail!(
                "unsupported template catalog version {} (expected {CATALOG_VERSION})",
                self.version
            );
        }
        if self.styles.is_empty() {
            bail!("template catalog defines no styles");
        }
        for style in &self.styles {
            if style.templates.is_empty() {
                bail!("style `{}` has no templates", style.name);
            }
            for template in &style.templates {
                if !template.contains(NAME_PLACEHOLDER) || !template.contains(AMOUNT_PLACEHOLDER) {
                    bail!(
                        "template in style `{}` lacks {NAME_PLACEHOLDER} or {AMOUNT_PLACEHOLDER}: {template}",
                        style.name
                    );
                }
            }
        }
        for entry in &self.schedule {
            if self.style(&entry.style).is_none() {
                bail!("schedule references unknown style `{}`", entry.style);
            }
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn styles(&self) -> &[TemplateStyle] {
        &self.styles
    }

    pub fn style(&self, name: &str) -> Option<&TemplateStyle> {
        self.styles.iter().find(|s| s.name == name)
    }

    /// The pool active on `effective_date`: the first scheduled style whose
    /// cutoff is still ahead, otherwise every style flattened in catalog order.
    pub fn pool_for(&self, effective_date: NaiveDate) -> Vec<&str> {
        let scheduled = self
            .schedule
            .iter()
            .find(|entry| effective_date < entry.until)
            .and_then(|entry| self.style(&entry.style));
        match scheduled {
            Some(style) => style.templates.iter().map(String::as_str).collect(),
            None => self
                .styles
                .iter()
                .flat_map(|s| s.templates.iter().map(String::as_str))
                .collect(),
        }
    }
}

pub fn render_template(template: &str, name: &str, amount: &str) -> String {
    template
        .replace(NAME_PLACEHOLDER, name)
        .replace(AMOUNT_PLACEHOLDER, amount)
}

/// Picks template indices so that no identity sees a repeat until it has
/// seen the whole pool. Cycles are tracked per identity in `RotationHistory`.
#[derive(Debug)]
pub struct TemplateSelector<R> {
    rng: R,
}

impl<R: Rng> TemplateSelector<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Chooses and records an index in `0..pool_len`; `None` for an empty pool.
    pub fn select(
        &mut self,
        canonical_name: &str,
        history: &mut RotationHistory,
        pool_len: usize,
    ) -> Option<usize> {
        if pool_len == 0 {
            return None;
        }
        let used = history.entry(canonical_name.to_string()).or_default();
        let mut available: Vec<usize> = (0..pool_len).filter(|i| !used.contains(i)).collect();
        if available.is_empty() {
            used.clear();
            available = (0..pool_len).collect();
        }
        let chosen = *available.choose(&mut self.rng)?;
        used.push(chosen);
        Some(chosen)
    }

    /// Selects a template for `canonical_name` and renders it.
    pub fn render(
        &mut self,
        canonical_name: &str,
        display_amount: &str,
        history: &mut RotationHistory,
        pool: &[&str],
    ) -> Option<String> {
        let index = self.select(canonical_name, history, pool.len())?;
        Some(render_template(pool[index], canonical_name, display_amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn builtin_catalog_loads_three_styles() {
        let catalog = TemplateCatalog::builtin().expect("builtin");
        assert_eq!(catalog.styles().len(), 3);
        assert!(catalog.styles().iter().all(|s| s.templates.len() == 30));
    }

    #[test]
    fn scheduled_style_runs_alone_until_cutoff() {
        let catalog = TemplateCatalog::builtin().expect("builtin");
        let promo = catalog.style("over_the_top").expect("style");

        let before = catalog.pool_for(date("2026-03-02"));
        assert_eq!(before.len(), promo.templates.len());
        assert_eq!(before[0], promo.templates[0]);

        assert_eq!(catalog.pool_for(date("2026-03-03")).len(), 90);
        assert_eq!(catalog.pool_for(date("2026-10-19")).len(), 90);
    }

    #[test]
    fn k_selections_form_a_permutation_then_a_new_cycle_starts() {
        let mut selector = TemplateSelector::new(StdRng::seed_from_u64(7));
        let mut history = RotationHistory::new();
        let k = 6;

        let cycle: Vec<usize> = (0..k)
            .map(|_| selector.select("张三", &mut history, k).expect("index"))
            .collect();
        let distinct: BTreeSet<_> = cycle.iter().copied().collect();
        assert_eq!(distinct.len(), k);

        let next = selector.select("张三", &mut history, k).expect("index");
        assert!(next < k);
        assert_eq!(history.get("张三"), Some(&vec![next]));
    }

    #[test]
    fn cycles_are_independent_per_identity() {
        let mut selector = TemplateSelector::new(StdRng::seed_from_u64(1));
        let mut history = RotationHistory::new();
        for _ in 0..3 {
            selector.select("张三", &mut history, 3);
        }
        selector.select("李四", &mut history, 3);
        assert_eq!(history["张三"].len(), 3);
        assert_eq!(history["李四"].len(), 1);
    }

    #[test]
    fn stale_out_of_range_history_still_resets() {
        let mut selector = TemplateSelector::new(StdRng::seed_from_u64(3));
        let mut history = RotationHistory::new();
        history.insert("张三".into(), vec![0, 1, 45, 80]);
        let index = selector.select("张三", &mut history, 2).expect("index");
        assert!(index < 2);
        assert_eq!(history["张三"], vec![index]);
    }

    #[test]
    fn render_substitutes_both_placeholders() {
        let mut selector = TemplateSelector::new(StdRng::seed_from_u64(9));
        let mut history = RotationHistory::new();
        let pool = ["{name} 拿下 {amount}"];
        let text = selector
            .render("张三", "1.5万", &mut history, &pool)
            .expect("rendered");
        assert_eq!(text, "张三 拿下 1.5万");
        assert!(selector.render("张三", "1.5万", &mut history, &[]).is_none());
    }

    #[test]
    fn invalid_catalogs_are_rejected() {
        assert!(TemplateCatalog::from_yaml_str("version: 1\nstyles: []\n").is_err());
        let err = TemplateCatalog::from_yaml_str(
            "version: 2\nstyles:\n  - name: a\n    templates: [\"{name} {amount}\"]\n",
        )
        .expect_err("future version");
        assert!(err.to_string().contains("unsupported template catalog version 2"));
        assert!(TemplateCatalog::from_yaml_str(
            "version: 1\nstyles:\n  - name: a\n    templates: [\"no placeholders\"]\n"
        )
        .is_err());
        assert!(TemplateCatalog::from_yaml_str(
            "version: 1\nstyles:\n  - name: a\n    templates: [\"{name} {amount}\"]\nschedule:\n  - style: b\n    until: \"2026-01-01\"\n"
        )
        .is_err());
    }
}
