/// Exchange holiday calendar
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashSet;

/// Full-day US equity market closures (update annually)
const US_EQUITY_HOLIDAYS: &[(i32, u32, u32)] = &[
    // 2024
    (2024, 1, 1),   // New Year's Day
    (2024, 1, 15),  // Martin Luther King Jr. Day
    (2024, 2, 19),  // Washington's Birthday
    (2024, 3, 29),  // Good Friday
    (2024, 5, 27),  // Memorial Day
    (2024, 6, 19),  // Juneteenth
    (2024, 7, 4),   // Independence Day
    (2024, 9, 2),   // Labor Day
    (2024, 11, 28), // Thanksgiving
    (2024, 12, 25), // Christmas
    // 2025
    (2025, 1, 1),
    (2025, 1, 9), // National Day of Mourning
    (2025, 1, 20),
    (2025, 2, 17),
    (2025, 4, 18),
    (2025, 5, 26),
    (2025, 6, 19),
    (2025, 7, 4),
    (2025, 9, 1),
    (2025, 11, 27),
    (2025, 12, 25),
    // 2026
    (2026, 1, 1),
    (2026, 1, 19),
    (2026, 2, 16),
    (2026, 4, 3),
    (2026, 5, 25),
    (2026, 6, 19),
    (2026, 7, 3),
    (2026, 9, 7),
    (2026, 11, 26),
    (2026, 12, 25),
];

/// Set of non-trading dates on top of weekends
#[derive(Debug, Clone, Default)]
pub struct HolidayCalendar {
    holidays: HashSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        HolidayCalendar {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// NYSE/NASDAQ closures
    pub fn us_equities() -> Self {
        Self::new(
            US_EQUITY_HOLIDAYS
                .iter()
                .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
        )
    }

    pub fn with_extra(mut self, extra: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(extra);
        self
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Not a weekend and not a listed holiday
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        is_weekday(date) && !self.is_holiday(date)
    }

    pub fn len(&self) -> usize {
        self.holidays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holidays.is_empty()
    }
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}
