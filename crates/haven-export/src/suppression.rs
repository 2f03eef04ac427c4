/// Counts of 1 through `SUPPRESSION_THRESHOLD - 1` are masked.
pub const SUPPRESSION_THRESHOLD: u64 = 5;

pub const DEFAULT_MARKER: &str = "*";

/// An aggregate cell after disclosure control. It has no text form of its
/// own; `SuppressionAggregator::render` supplies the configured marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellValue {
    Count(u64),
    Suppressed,
}

impl From<u64> for CellValue {
    fn from(count: u64) -> Self {
        CellValue::Count(count)
    }
}

/// Small-cell suppression for aggregate counts.
///
/// `suppress` takes either a raw count or a previously suppressed cell, so
/// applying it to its own output is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressionAggregator {
    marker: String,
}

impl Default for SuppressionAggregator {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

impl SuppressionAggregator {
    /// The marker must be non-empty and must not parse as a number, so it
    /// can never be mistaken for a true count.
    pub fn with_marker(marker: impl Into<String>) -> Option<Self> {
        let marker = marker.into();
        if marker.trim().is_empty() || marker.trim().parse::<f64>().is_ok() {
            return None;
        }
        Some(Self { marker })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn suppress(&self, value: impl Into<CellValue>) -> CellValue {
        match value.into() {
            CellValue::Count(c) if c == 0 || c >= SUPPRESSION_THRESHOLD => CellValue::Count(c),
            CellValue::Count(_) | CellValue::Suppressed => CellValue::Suppressed,
        }
    }

    /// Text as it leaves the trust boundary.
    pub fn render(&self, cell: CellValue) -> String {
        match cell {
            CellValue::Count(c) => c.to_string(),
            CellValue::Suppressed => self.marker.clone(),
        }
    }

    pub fn suppress_display(&self, count: u64) -> String {
        self.render(self.suppress(count))
    }

    /// Percentage with one decimal. `N/A` for a zero denominator; a small
    /// numerator is masked since the rate would reveal it.
    pub fn suppress_rate(&self, numerator: u64, denominator: u64) -> String {
        if denominator == 0 {
            return "N/A".to_string();
        }
        match self.suppress(numerator) {
            CellValue::Suppressed => self.marker.clone(),
            CellValue::Count(n) => format!("{:.1}%", n as f64 * 100.0 / denominator as f64),
        }
    }
}
