use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fraction of the daily goal reached. Exceeds 1.0 past the goal and is 0
/// for a non-positive goal.
pub fn progress_toward_goal(total_daily_steps: u64, daily_goal: i64) -> f64 {
    if daily_goal <= 0 {
        return 0.0;
    }
    total_daily_steps as f64 / daily_goal as f64
}

/// Consecutive-day activity streak.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Streak {
    pub current: u32,
    pub longest: u32,
    pub last_active: Option<NaiveDate>,
}

impl Streak {
    pub fn record_activity(&mut self, day: NaiveDate) {
        match self.last_active {
            Some(last) if day <= last => return,
            Some(last) if (day - last).num_days() == 1 => {
                self.current = self.current.saturating_add(1);
            }
            _ => self.current = 1,
        }

        self.last_active = Some(day);
        self.longest = self.longest.max(self.current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, n).unwrap()
    }

    #[test]
    fn progress_is_plain_ratio() {
        assert_eq!(progress_toward_goal(5_000, 10_000), 0.5);
        assert_eq!(progress_toward_goal(15_000, 10_000), 1.5);
        assert_eq!(progress_toward_goal(0, 10_000), 0.0);
    }

    #[test]
    fn progress_is_zero_without_goal() {
        assert_eq!(progress_toward_goal(5_000, 0), 0.0);
        assert_eq!(progress_toward_goal(5_000, -10), 0.0);
    }

    #[test]
    fn consecutive_days_extend_streak() {
        let mut streak = Streak::default();
        streak.record_activity(day(1));
        streak.record_activity(day(2));
        streak.record_activity(day(3));
        assert_eq!(streak.current, 3);
        assert_eq!(streak.longest, 3);
    }

    #[test]
    fn gap_resets_current_but_keeps_longest() {
        let mut streak = Streak::default();
        streak.record_activity(day(1));
        streak.record_activity(day(2));
        streak.record_activity(day(3));
        streak.record_activity(day(6));
        assert_eq!(streak.current, 1);
        assert_eq!(streak.longest, 3);
    }

    #[test]
    fn same_day_is_counted_once() {
        let mut streak = Streak::default();
        streak.record_activity(day(4));
        streak.record_activity(day(4));
        assert_eq!(streak.current, 1);
        assert_eq!(streak.last_active, Some(day(4)));
    }
}
