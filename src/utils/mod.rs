use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::{Asia::Bangkok, Tz};

/// Bangkok timezone constant. The legacy database stores local wall-clock
/// time, so every persisted timestamp goes through this zone.
pub const BANGKOK_TZ: Tz = Bangkok;

/// Get current time in Bangkok timezone
pub fn bangkok_now() -> DateTime<Tz> {
    Utc::now().with_timezone(&BANGKOK_TZ)
}

/// Get current time in Bangkok timezone as RFC3339 string
pub fn bangkok_now_rfc3339() -> String {
    bangkok_now().to_rfc3339()
}

/// Format a timestamp the way the printed transfer receipt shows it, e.g.
/// `28-07-26` for 28 July 2026.
pub fn receipt_date(timestamp: &NaiveDateTime) -> String {
    timestamp.format("%d-%m-%y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Offset};

    #[test]
    fn bangkok_is_seven_hours_ahead_of_utc() {
        let bangkok_time = bangkok_now();
        let diff = bangkok_time.offset().fix().local_minus_utc();
        assert_eq!(diff, 7 * 3600);
    }

    #[test]
    fn rfc3339_carries_bangkok_offset() {
        let rfc3339_string = bangkok_now_rfc3339();
        assert!(rfc3339_string.contains("+07:00"));
    }

    #[test]
    fn receipt_date_is_day_month_two_digit_year() {
        let ts = NaiveDate::from_ymd_opt(2026, 7, 28)
            .unwrap()
            .and_hms_opt(14, 5, 0)
            .unwrap();
        assert_eq!(receipt_date(&ts), "28-07-26");
    }
}
