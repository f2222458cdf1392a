use super::*;
use time::PrimitiveDateTime;

fn utc(year: i32, month: Month, day: u8, hour: u8, minute: u8) -> OffsetDateTime {
    let date = Date::from_calendar_date(year, month, day).unwrap();
    PrimitiveDateTime::new(date, Time::from_hms(hour, minute, 0).unwrap()).assume_utc()
}

#[test]
fn parses_frequency_and_clock() {
    let schedule = Schedule::parse("weekly 03:30").unwrap();
    assert_eq!(schedule.frequency, Frequency::Weekly);
    assert_eq!((schedule.hour, schedule.minute), (3, 30));
    assert_eq!(schedule.to_string(), "weekly 03:30");
}

#[test]
fn clock_defaults_to_two_am() {
    let schedule = Schedule::parse("Monthly").unwrap();
    assert_eq!(schedule.frequency, Frequency::Monthly);
    assert_eq!((schedule.hour, schedule.minute), (2, 0));
}

#[test]
fn rejects_malformed_schedules() {
    assert!(Schedule::parse("").is_err());
    assert!(Schedule::parse("hourly").is_err());
    assert!(Schedule::parse("daily 24:00").is_err());
    assert!(Schedule::parse("daily 2").is_err());
    assert!(Schedule::parse("daily 02:00 extra").is_err());
}

#[test]
fn daily_runs_today_or_tomorrow() {
    let schedule = Schedule::parse("daily 02:00").unwrap();
    assert_eq!(
        schedule.next_after(utc(2024, Month::June, 3, 1, 0)),
        utc(2024, Month::June, 3, 2, 0)
    );
    assert_eq!(
        schedule.next_after(utc(2024, Month::June, 3, 2, 0)),
        utc(2024, Month::June, 4, 2, 0)
    );
}

#[test]
fn weekly_runs_on_mondays() {
    let schedule = Schedule::parse("weekly 04:00").unwrap();
    // 2024-06-05 is a Wednesday.
    assert_eq!(
        schedule.next_after(utc(2024, Month::June, 5, 12, 0)),
        utc(2024, Month::June, 10, 4, 0)
    );
    // 2024-06-10 is a Monday.
    assert_eq!(
        schedule.next_after(utc(2024, Month::June, 10, 3, 59)),
        utc(2024, Month::June, 10, 4, 0)
    );
}

#[test]
fn monthly_rolls_over_the_year() {
    let schedule = Schedule::parse("monthly 00:30").unwrap();
    assert_eq!(
        schedule.next_after(utc(2024, Month::December, 15, 0, 0)),
        utc(2025, Month::January, 1, 0, 30)
    );
    assert_eq!(
        schedule.next_after(utc(2024, Month::May, 1, 0, 0)),
        utc(2024, Month::May, 1, 0, 30)
    );
}

#[test]
fn duration_until_clamps_past_instants() {
    let now = utc(2024, Month::June, 3, 2, 0);
    assert_eq!(duration_until(now, now - time::Duration::minutes(5)), Duration::ZERO);
    assert_eq!(
        duration_until(now, now + time::Duration::minutes(5)),
        Duration::from_secs(300)
    );
}

