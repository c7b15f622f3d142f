//! Usage figures reported by providers and measured by meters.

use serde::{Deserialize, Serialize};

use crate::pricing::{billable_minutes, call_charge, chat_charge, Rates};

/// Cumulative usage reported by the chat provider for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUsage {
    /// Prompt-side units.
    #[serde(default)]
    pub prompt_units: u64,
    /// Completion-side units.
    #[serde(default)]
    pub completion_units: u64,
    /// Total units as reported (falls back to the sum when the provider omits it).
    #[serde(default)]
    pub total_units: u64,
}

impl ChatUsage {
    /// Units to bill.
    #[must_use]
    pub fn billable_units(&self) -> u64 {
        if self.total_units > 0 {
            self.total_units
        } else {
            self.prompt_units + self.completion_units
        }
    }

    /// Credits this usage costs at `rates` with `markup`.
    #[must_use]
    pub fn credits(&self, rates: &Rates, markup: f64) -> i64 {
        chat_charge(self.billable_units(), rates.chat_per_1k, markup)
    }
}

/// Connected time measured for a voice call, against what was already billed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUsage {
    /// Seconds between connect and the measurement.
    pub elapsed_seconds: u64,
    /// Minutes charged by earlier settlements.
    #[serde(default)]
    pub billed_minutes: u64,
}

impl CallUsage {
    /// Minutes the elapsed time is worth (partial minutes round up), never fewer
    /// than were already billed.
    #[must_use]
    pub fn minutes(&self) -> u64 {
        billable_minutes(self.elapsed_seconds).max(self.billed_minutes)
    }

    /// Minutes not yet billed.
    #[must_use]
    pub fn due_minutes(&self) -> u64 {
        self.minutes() - self.billed_minutes
    }

    /// Credits the unbilled minutes cost at `rates`.
    #[must_use]
    pub fn credits_due(&self, rates: &Rates) -> i64 {
        call_charge(self.due_minutes().saturating_mul(60), rates.call_per_minute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::DEFAULT_CHAT_MARKUP;

    #[test]
    fn billable_units_prefers_total() {
        let usage = ChatUsage {
            prompt_units: 100,
            completion_units: 50,
            total_units: 2300,
        };
        assert_eq!(usage.billable_units(), 2300);
        assert_eq!(usage.credits(&Rates::free(), DEFAULT_CHAT_MARKUP), 6);
    }

    #[test]
    fn billable_units_sums_when_total_missing() {
        let usage = ChatUsage {
            prompt_units: 1500,
            completion_units: 800,
            total_units: 0,
        };
        assert_eq!(usage.billable_units(), 2300);
    }

    #[test]
    fn call_usage_minutes() {
        let usage = CallUsage {
            elapsed_seconds: 90,
            billed_minutes: 0,
        };
        assert_eq!(usage.minutes(), 2);
        let rates = Rates {
            call_per_minute: 8,
            ..Rates::free()
        };
        assert_eq!(usage.credits_due(&rates), 16);
    }

    #[test]
    fn call_usage_charges_only_unbilled_minutes() {
        let rates = Rates {
            call_per_minute: 8,
            ..Rates::free()
        };
        let usage = CallUsage {
            elapsed_seconds: 150,
            billed_minutes: 2,
        };
        assert_eq!(usage.due_minutes(), 1);
        assert_eq!(usage.credits_due(&rates), 8);

        // A settlement that ran ahead of the measured time is never refunded.
        let ahead = CallUsage {
            elapsed_seconds: 30,
            billed_minutes: 2,
        };
        assert_eq!(ahead.minutes(), 2);
        assert_eq!(ahead.credits_due(&rates), 0);
    }
}
