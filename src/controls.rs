//! Fetch pacing and budget controls shared by the orchestrator and the ingest binary.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Args;

use crate::vehicle::Source;

/// How much of one source a single ingest pass may fetch, and when.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceBudget {
    max_pages: u32,
    tier: u8,
}

impl SourceBudget {
    /// Constructs a budget of `max_pages` pages launched in priority `tier` (1 = first).
    pub fn new(max_pages: u32, tier: u8) -> Self {
        Self {
            max_pages,
            tier: tier.max(1),
        }
    }

    /// Maximum number of results pages fetched per run.
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Launch tier; lower tiers start first.
    pub fn tier(&self) -> u8 {
        self.tier
    }
}

/// Tunable knobs that bound a fetch pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceControls {
    budgets: BTreeMap<Source, SourceBudget>,
    page_delay: Duration,
    page_timeout: Duration,
    deadline: Duration,
}

impl SourceControls {
    /// Constructs controls from explicit budgets and timings.
    pub fn new(
        budgets: BTreeMap<Source, SourceBudget>,
        page_delay: Duration,
        page_timeout: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            budgets,
            page_delay,
            page_timeout,
            deadline,
        }
    }

    /// Budget for `source`, if it is enabled.
    pub fn budget(&self, source: Source) -> Option<SourceBudget> {
        self.budgets.get(&source).copied()
    }

    /// Enabled sources in launch order (tier, then declaration order).
    pub fn launch_order(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self
            .budgets
            .iter()
            .filter(|(_, budget)| budget.max_pages > 0)
            .map(|(source, _)| *source)
            .collect();
        sources.sort_by_key(|source| (self.budgets[source].tier, *source));
        sources
    }

    /// Time to wait between two pages of the same source.
    pub fn page_delay(&self) -> Duration {
        self.page_delay
    }

    /// Timeout applied to each page fetch.
    pub fn page_timeout(&self) -> Duration {
        self.page_timeout
    }

    /// Bound on the whole fetch phase.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Keeps only the given sources enabled.
    pub fn restrict_to(mut self, sources: &[Source]) -> Self {
        self.budgets.retain(|source, _| sources.contains(source));
        self
    }

    /// Overrides the page budget of one source, enabling it at tier 3 if it was off.
    pub fn with_pages(mut self, source: Source, max_pages: u32) -> Self {
        let tier = self.budget(source).map(|b| b.tier).unwrap_or(3);
        self.budgets.insert(source, SourceBudget::new(max_pages, tier));
        self
    }

    /// Replaces the inter-page delay.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }
}

impl Default for SourceControls {
    fn default() -> Self {
        let budgets = BTreeMap::from([
            (Source::TuCarro, SourceBudget::new(10, 1)),
            (Source::MercadoLibre, SourceBudget::new(10, 1)),
            (Source::Autocosmos, SourceBudget::new(5, 2)),
            (Source::Buscomiauto, SourceBudget::new(3, 2)),
            (Source::Multimarca, SourceBudget::new(3, 3)),
        ]);
        Self {
            budgets,
            page_delay: Duration::from_secs(2),
            page_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(15 * 60),
        }
    }
}

/// Command-line flags that shape a fetch pass; flattened into the ingest CLI.
#[derive(Args, Debug, Clone)]
pub struct ControlArgs {
    /// Sources to fetch, comma separated (default: all)
    #[arg(long, env = "CARCRAWL_SOURCES", value_delimiter = ',')]
    pub sources: Vec<Source>,

    /// Page budget overrides, e.g. `tucarro=4,multimarca=1`
    #[arg(long, env = "CARCRAWL_PAGES", value_delimiter = ',', value_parser = parse_page_override)]
    pub pages: Vec<(Source, u32)>,

    /// Milliseconds to wait between pages of one source
    #[arg(long, env = "CARCRAWL_PAGE_DELAY_MS", default_value_t = 2_000)]
    pub page_delay_ms: u64,

    /// Seconds before a single page fetch is abandoned
    #[arg(long, env = "CARCRAWL_PAGE_TIMEOUT", default_value_t = 30)]
    pub page_timeout_secs: u64,

    /// Seconds before the whole fetch phase is cut short
    #[arg(long, env = "CARCRAWL_FETCH_DEADLINE", default_value_t = 900)]
    pub deadline_secs: u64,
}

impl ControlArgs {
    /// Converts the parsed flags into `SourceControls`.
    pub fn build_controls(&self) -> SourceControls {
        let mut controls = SourceControls::new(
            SourceControls::default().budgets,
            Duration::from_millis(self.page_delay_ms),
            Duration::from_secs(self.page_timeout_secs.max(1)),
            Duration::from_secs(self.deadline_secs.max(1)),
        );
        if !self.sources.is_empty() {
            controls = controls.restrict_to(&self.sources);
        }
        for (source, pages) in &self.pages {
            controls = controls.with_pages(*source, *pages);
        }
        controls
    }
}

fn parse_page_override(value: &str) -> Result<(Source, u32), String> {
    let (name, pages) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <source>=<pages>, got '{value}'"))?;
    let pages = pages
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid page count in '{value}': {err}"))?;
    Ok((name.parse()?, pages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        controls: ControlArgs,
    }

    #[test]
    fn default_launch_order_follows_tiers() {
        assert_eq!(
            SourceControls::default().launch_order(),
            vec![
                Source::TuCarro,
                Source::MercadoLibre,
                Source::Autocosmos,
                Source::Buscomiauto,
                Source::Multimarca,
            ]
        );
    }

    #[test]
    fn zero_page_budget_disables_source() {
        let controls = SourceControls::default().with_pages(Source::TuCarro, 0);
        assert!(!controls.launch_order().contains(&Source::TuCarro));
    }

    #[test]
    fn cli_overrides_apply() {
        let harness = Harness::parse_from([
            "test",
            "--sources",
            "autocosmos,multimarca",
            "--pages",
            "multimarca=7",
            "--page-delay-ms",
            "10",
        ]);
        let controls = harness.controls.build_controls();
        assert_eq!(
            controls.launch_order(),
            vec![Source::Autocosmos, Source::Multimarca]
        );
        assert_eq!(controls.budget(Source::Multimarca), Some(SourceBudget::new(7, 3)));
        assert_eq!(controls.page_delay(), Duration::from_millis(10));
    }

    #[test]
    fn malformed_page_override_is_rejected() {
        assert!(parse_page_override("tucarro").is_err());
        assert!(parse_page_override("nowhere=3").is_err());
        assert_eq!(parse_page_override("tucarro=2"), Ok((Source::TuCarro, 2)));
    }
}
