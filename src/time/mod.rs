pub mod holidays;

pub use holidays::{is_weekday, HolidayCalendar};

use chrono::{NaiveDate, Utc};
use chrono_tz::America::New_York;

/// Current calendar date on the US exchanges
pub fn market_today() -> NaiveDate {
    Utc::now().with_timezone(&New_York).date_naive()
}
