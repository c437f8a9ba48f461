/// Splits a date span into business-day request windows
use std::sync::Arc;

use chrono::{Duration, NaiveDate};

use crate::time::{is_weekday, HolidayCalendar};
use crate::types::{BatchSpec, Interval};

#[derive(Debug, Clone)]
pub struct BatchPlanner {
    batch_days: usize,
    calendar: Option<Arc<HolidayCalendar>>,
}

impl BatchPlanner {
    pub fn new(batch_days: usize) -> Self {
        BatchPlanner {
            batch_days: batch_days.max(1),
            calendar: None,
        }
    }

    /// Also skip the calendar's holidays
    pub fn with_calendar(mut self, calendar: Arc<HolidayCalendar>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn batch_days(&self) -> usize {
        self.batch_days
    }

    /// Inclusive list of trading days between `start` and `end`
    pub fn business_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut day = start;

        while day <= end {
            let open = match &self.calendar {
                Some(calendar) => calendar.is_trading_day(day),
                None => is_weekday(day),
            };
            if open {
                days.push(day);
            }
            day += Duration::days(1);
        }

        days
    }

    /// Ordered, non-overlapping windows covering every business day once
    pub fn plan(&self, start: NaiveDate, end: NaiveDate, interval: Interval) -> Vec<BatchSpec> {
        self.business_days(start, end)
            .chunks(self.batch_days)
            .filter_map(|chunk| {
                Some(BatchSpec {
                    from_date: *chunk.first()?,
                    to_date: *chunk.last()?,
                    interval,
                })
            })
            .collect()
    }
}

impl Default for BatchPlanner {
    fn default() -> Self {
        BatchPlanner::new(3)
    }
}
