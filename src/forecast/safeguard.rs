use ordered_float::OrderedFloat;

/// Caps today's forecast relative to the best recent day
#[derive(Debug, Clone, Copy)]
pub struct Safeguard {
    pub ratio: f64,
    pub min_history_days: usize,
}

impl Safeguard {
    /// Cap for today's total, or `None` when there is too little history or
    /// `raw_total` is within bounds.
    pub fn cap(&self, raw_total: f64, recent_totals: &[f64]) -> Option<f64> {
        let usable: Vec<f64> = recent_totals
            .iter()
            .copied()
            .filter(|v| v.is_finite() && *v > 0.0)
            .collect();
        if usable.len() < self.min_history_days {
            return None;
        }
        let best = usable.into_iter().map(OrderedFloat).max()?.into_inner();
        let cap = best * self.ratio;
        (raw_total > cap).then_some(cap)
    }
}
