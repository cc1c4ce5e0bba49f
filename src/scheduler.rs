//! Fast/medium/slow tier selection from a single cycle counter.

/// Which tiers run on a given cycle. The fast tier always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tiers {
    pub fast: bool,
    pub medium: bool,
    pub slow: bool,
}

/// Multiplexes medium and slow cadences off the fast wake cycle.
///
/// With a fast interval of 2s and multiples of 15 and 60, medium work runs
/// every 30s and slow work every 2 minutes.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    iteration: i64,
    medium_multiple: u32,
    slow_multiple: u32,
}

impl PollScheduler {
    /// Multiples must be non-zero; the config layer rejects zero.
    pub fn new(medium_multiple: u32, slow_multiple: u32) -> Self {
        Self {
            // -1 so the first cycle is iteration 0 and every tier runs
            iteration: -1,
            medium_multiple: medium_multiple.max(1),
            slow_multiple: slow_multiple.max(1),
        }
    }

    /// Advance to the next cycle and report which tiers are due.
    pub fn on_cycle(&mut self) -> Tiers {
        self.iteration += 1;
        Tiers {
            fast: true,
            medium: self.iteration % i64::from(self.medium_multiple) == 0,
            slow: self.iteration % i64::from(self.slow_multiple) == 0,
        }
    }

    /// Current iteration, -1 before the first cycle.
    pub fn iteration(&self) -> i64 {
        self.iteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cycle_runs_everything() {
        let mut scheduler = PollScheduler::new(15, 60);
        assert_eq!(scheduler.iteration(), -1);
        assert_eq!(
            scheduler.on_cycle(),
            Tiers { fast: true, medium: true, slow: true }
        );
        assert_eq!(scheduler.iteration(), 0);
    }

    #[test]
    fn tiers_due_at_known_iterations() {
        let mut scheduler = PollScheduler::new(15, 60);
        let tiers: Vec<Tiers> = (0..=60).map(|_| scheduler.on_cycle()).collect();

        let fast_only = Tiers { fast: true, medium: false, slow: false };
        let fast_medium = Tiers { fast: true, medium: true, slow: false };
        let all = Tiers { fast: true, medium: true, slow: true };

        assert_eq!(tiers[1], fast_only);
        assert_eq!(tiers[14], fast_only);
        assert_eq!(tiers[15], fast_medium);
        assert_eq!(tiers[30], fast_medium);
        assert_eq!(tiers[45], fast_medium);
        assert_eq!(tiers[59], fast_only);
        assert_eq!(tiers[60], all);
    }

    #[test]
    fn multiple_of_one_runs_every_cycle() {
        let mut scheduler = PollScheduler::new(1, 1);
        for _ in 0..5 {
            let tiers = scheduler.on_cycle();
            assert!(tiers.medium && tiers.slow);
        }
    }
}
