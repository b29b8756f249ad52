//! Exchange trading-window checks.
//!
//! The scheduler's "today" is the exchange-local date, not UTC: an
//! iteration right after midnight UTC must not count for the previous
//! local trading day.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};

use crate::ports::config_port::ConfigPort;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradingCalendar {
    pub utc_offset: FixedOffset,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl TradingCalendar {
    /// MOEX main session: 10:00–18:45 Moscow time (UTC+3).
    pub fn moex() -> Self {
        TradingCalendar {
            utc_offset: FixedOffset::east_opt(3 * 3600).expect("valid offset"),
            open: NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"),
            close: NaiveTime::from_hms_opt(18, 45, 0).expect("valid time"),
        }
    }

    /// Read `[calendar]` overrides, falling back to MOEX defaults.
    pub fn from_config(config: &dyn ConfigPort) -> Self {
        let default = Self::moex();
        let offset_hours = config.get_double(
            "calendar",
            "utc_offset_hours",
            default.utc_offset.local_minus_utc() as f64 / 3600.0,
        );
        let utc_offset = FixedOffset::east_opt((offset_hours * 3600.0) as i32)
            .unwrap_or(default.utc_offset);

        let parse_time = |key: &str, fallback: NaiveTime| {
            config
                .get_string("calendar", key)
                .and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M").ok())
                .unwrap_or(fallback)
        };

        TradingCalendar {
            utc_offset,
            open: parse_time("open", default.open),
            close: parse_time("close", default.close),
        }
    }

    fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.utc_offset)
    }

    /// The exchange-local date used for the once-per-day guard.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date_naive()
    }

    pub fn is_weekend(&self, now: DateTime<Utc>) -> bool {
        matches!(self.local(now).weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Inside the open/close window on the exchange clock.
    pub fn in_session(&self, now: DateTime<Utc>) -> bool {
        let t = self.local(now).time();
        t >= self.open && t <= self.close
    }

    /// Whether an iteration is allowed right now for a run.
    pub fn may_trade(&self, now: DateTime<Utc>, trade_on_weekends: bool) -> bool {
        self.in_session(now) && (trade_on_weekends || !self.is_weekend(now))
    }
}
