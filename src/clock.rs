//! Exchange-time computations: sessions, holidays, DTE.
//!
//! All session and expiration decisions use the exchange-local calendar
//! (America/New_York for US listed options), never UTC. A play created at
//! 23:00 local the day before expiration reports DTE = 1.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

fn regular_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).expect("valid time")
}

fn regular_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).expect("valid time")
}

fn early_close() -> NaiveTime {
    NaiveTime::from_hms_opt(13, 0, 0).expect("valid time")
}

/// Exchange clock. Construct once from config and share.
#[derive(Debug, Clone)]
pub struct MarketClock {
    tz: Tz,
    extended_hours: bool,
    /// Fixed "now" for deterministic evaluation in tests and replays.
    frozen_now: Option<DateTime<Utc>>,
}

impl MarketClock {
    pub fn new(tz: Tz, extended_hours: bool) -> Self {
        Self {
            tz,
            extended_hours,
            frozen_now: None,
        }
    }

    /// Clock pinned to a fixed instant. Used by tests and the `validate`
    /// command so decisions are reproducible.
    pub fn fixed(tz: Tz, now_utc: DateTime<Utc>) -> Self {
        Self {
            tz,
            extended_hours: false,
            frozen_now: Some(now_utc),
        }
    }

    pub fn with_extended_hours(mut self, enabled: bool) -> Self {
        self.extended_hours = enabled;
        self
    }

    /// Current instant in the exchange timezone.
    pub fn now(&self) -> DateTime<Tz> {
        let utc = self.frozen_now.unwrap_or_else(Utc::now);
        utc.with_timezone(&self.tz)
    }

    /// Today's date on the exchange-local calendar.
    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    pub fn extended_hours_enabled(&self) -> bool {
        self.extended_hours
    }

    /// True while the regular session is trading (or, with extended hours
    /// enabled, any time on a trading day).
    pub fn is_primary_session(&self) -> bool {
        let now = self.now();
        let date = now.date_naive();
        let Some(close) = self.session_close_time(date) else {
            return false;
        };
        if self.extended_hours {
            return true;
        }
        let t = now.time();
        t >= regular_open() && t < close
    }

    /// True when the exchange opens at all today.
    pub fn is_open_today(&self) -> bool {
        Self::is_trading_day(self.today())
    }

    /// Regular-session close for a date, `None` on weekends and holidays.
    pub fn session_close_time(&self, date: NaiveDate) -> Option<NaiveTime> {
        if !Self::is_trading_day(date) {
            return None;
        }
        if Self::is_early_close(date) {
            Some(early_close())
        } else {
            Some(regular_close())
        }
    }

    /// Close of session for `date` as an instant, `None` on non-trading days.
    pub fn session_close_instant(&self, date: NaiveDate) -> Option<DateTime<Tz>> {
        let close = self.session_close_time(date)?;
        self.tz
            .from_local_datetime(&date.and_time(close))
            .single()
    }

    /// True when the current instant is at or past today's session close.
    pub fn is_past_session_close(&self) -> bool {
        match self.session_close_time(self.today()) {
            Some(close) => self.now().time() >= close,
            None => true,
        }
    }

    /// Calendar days from the exchange-local today to `expiration`.
    /// Negative once the expiration has passed.
    pub fn days_to_expiration(&self, expiration: NaiveDate) -> i64 {
        (expiration - self.today()).num_days()
    }

    pub fn is_trading_day(date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !Self::is_holiday(date)
    }

    /// US equity-exchange holiday set: fixed-date holidays with
    /// weekend-observation shifts plus the floating Monday/Thursday rules
    /// and Good Friday.
    pub fn is_holiday(date: NaiveDate) -> bool {
        let year = date.year();

        let observed = |m: u32, d: u32| -> Option<NaiveDate> {
            let actual = NaiveDate::from_ymd_opt(year, m, d)?;
            Some(match actual.weekday() {
                Weekday::Sat => actual - chrono::Duration::days(1),
                Weekday::Sun => actual + chrono::Duration::days(1),
                _ => actual,
            })
        };

        let fixed = [
            observed(1, 1),   // New Year's Day
            observed(6, 19),  // Juneteenth
            observed(7, 4),   // Independence Day
            observed(12, 25), // Christmas
        ];
        if fixed.iter().flatten().any(|d| *d == date) {
            return true;
        }

        let floating = [
            nth_weekday(year, 1, Weekday::Mon, 3),  // MLK Day
            nth_weekday(year, 2, Weekday::Mon, 3),  // Presidents' Day
            last_weekday(year, 5, Weekday::Mon),    // Memorial Day
            nth_weekday(year, 9, Weekday::Mon, 1),  // Labor Day
            nth_weekday(year, 11, Weekday::Thu, 4), // Thanksgiving
        ];
        if floating.iter().flatten().any(|d| *d == date) {
            return true;
        }

        good_friday(year) == Some(date)
    }

    /// Half-day sessions: July 3, day after Thanksgiving, Christmas Eve.
    pub fn is_early_close(date: NaiveDate) -> bool {
        let year = date.year();

        if let Some(jul3) = NaiveDate::from_ymd_opt(year, 7, 3) {
            if date == jul3 && Self::is_trading_day(jul3) {
                return true;
            }
        }
        if let Some(thanksgiving) = nth_weekday(year, 11, Weekday::Thu, 4) {
            if date == thanksgiving + chrono::Duration::days(1) {
                return true;
            }
        }
        if let Some(dec24) = NaiveDate::from_ymd_opt(year, 12, 24) {
            if date == dec24 && !matches!(dec24.weekday(), Weekday::Sat | Weekday::Sun) {
                return true;
            }
        }
        false
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first.checked_add_days(chrono::Days::new(u64::from(offset + (n - 1) * 7)))
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = next_month.pred_opt()?;
    let offset = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    last.checked_sub_days(chrono::Days::new(u64::from(offset)))
}

/// Good Friday = Easter Sunday − 2 days, Easter by the anonymous Gregorian
/// computus.
fn good_friday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    let easter = NaiveDate::from_ymd_opt(year, month as u32, day as u32)?;
    easter.checked_sub_days(chrono::Days::new(2))
}
