pub mod holidays;
pub mod session;

pub use holidays::{us_market_holidays, HolidayCalendar};
pub use session::SessionCalendar;
