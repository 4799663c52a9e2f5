//! Daily scheduled tasks: the morning flush and the calibration close.

use chrono::{DateTime, Local, NaiveDate, Timelike};

/// Tasks the scheduler can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyTask {
    /// Open every vent fully for an air exchange.
    Flush,
    /// Re-zero every vent's position simulation.
    Calibrate,
}

/// Once-per-day trigger bookkeeping. The controller asks every tick; each
/// task fires at most once per calendar day, during its configured hour.
#[derive(Debug, Default)]
pub struct DailySchedule {
    flush_hour: Option<u8>,
    calibration_hour: Option<u8>,
    last_flush: Option<NaiveDate>,
    last_calibration: Option<NaiveDate>,
}

impl DailySchedule {
    pub fn new(flush_hour: Option<u8>, calibration_hour: Option<u8>) -> Self {
        Self {
            flush_hour,
            calibration_hour,
            last_flush: None,
            last_calibration: None,
        }
    }

    /// Reconfigure the hours without losing the fired-today marks.
    pub fn set_hours(&mut self, flush_hour: Option<u8>, calibration_hour: Option<u8>) {
        self.flush_hour = flush_hour;
        self.calibration_hour = calibration_hour;
    }

    /// Tasks due at `now`, marking them fired for today.
    pub fn due(&mut self, now: DateTime<Local>) -> Vec<DailyTask> {
        let today = now.date_naive();
        let hour = now.hour() as u8;
        let mut due = Vec::new();
        if let Some(flush) = self.flush_hour {
            if hour == flush && self.last_flush != Some(today) {
                self.last_flush = Some(today);
                due.push(DailyTask::Flush);
            }
        }
        if let Some(calibration) = self.calibration_hour {
            if hour == calibration && self.last_calibration != Some(today) {
                self.last_calibration = Some(today);
                due.push(DailyTask::Calibrate);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, day, hour, 15, 0).unwrap()
    }

    #[test]
    fn test_fires_once_per_day() {
        let mut schedule = DailySchedule::new(Some(6), None);
        assert_eq!(schedule.due(at(1, 5)), vec![]);
        assert_eq!(schedule.due(at(1, 6)), vec![DailyTask::Flush]);
        // Same hour again: already fired.
        assert_eq!(schedule.due(at(1, 6)), vec![]);
        // Next day fires again.
        assert_eq!(schedule.due(at(2, 6)), vec![DailyTask::Flush]);
    }

    #[test]
    fn test_both_tasks_in_the_same_hour() {
        let mut schedule = DailySchedule::new(Some(4), Some(4));
        let due = schedule.due(at(1, 4));
        assert!(due.contains(&DailyTask::Flush));
        assert!(due.contains(&DailyTask::Calibrate));
    }

    #[test]
    fn test_unconfigured_hours_never_fire() {
        let mut schedule = DailySchedule::new(None, None);
        for hour in 0..24 {
            assert!(schedule.due(at(1, hour)).is_empty());
        }
    }
}
