#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    /// Mondays.
    Weekly,
    /// First day of the month.
    Monthly,
}

impl Frequency {
    fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

/// Recurring sync time in UTC, written as `daily 02:00`, `weekly 03:30` or `monthly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub frequency: Frequency,
    pub hour: u8,
    pub minute: u8,
}

impl Schedule {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let mut parts = value.split_whitespace();
        let frequency = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("daily") => Frequency::Daily,
            Some("weekly") => Frequency::Weekly,
            Some("monthly") => Frequency::Monthly,
            Some(other) => anyhow::bail!("unknown frequency {other:?}"),
            None => anyhow::bail!("schedule is empty"),
        };
        let (hour, minute) = match parts.next() {
            Some(clock) => parse_clock(clock)?,
            None => (2, 0),
        };
        if let Some(extra) = parts.next() {
            anyhow::bail!("unexpected schedule token {extra:?}");
        }
        Ok(Self {
            frequency,
            hour,
            minute,
        })
    }

    /// First scheduled instant strictly after `now`.
    pub fn next_after(&self, now: OffsetDateTime) -> OffsetDateTime {
        let now = now.to_offset(UtcOffset::UTC);
        let at = Time::from_hms(self.hour, self.minute, 0).unwrap_or(Time::MIDNIGHT);
        let on = |date: Date| date.with_time(at).assume_utc();

        match self.frequency {
            Frequency::Daily => {
                let today = on(now.date());
                if today > now {
                    today
                } else {
                    today + time::Duration::days(1)
                }
            }
            Frequency::Weekly => {
                let back = i64::from(now.weekday().number_days_from_monday());
                let monday = on(now.date() - time::Duration::days(back));
                if monday > now {
                    monday
                } else {
                    monday + time::Duration::weeks(1)
                }
            }
            Frequency::Monthly => {
                let first = first_of_month(now.year(), now.month()).map(on);
                match first {
                    Some(first) if first > now => first,
                    _ => {
                        let (year, month) = if now.month() == Month::December {
                            (now.year() + 1, Month::January)
                        } else {
                            (now.year(), now.month().next())
                        };
                        first_of_month(year, month)
                            .map(on)
                            .unwrap_or(now + time::Duration::days(31))
                    }
                }
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}",
            self.frequency.as_str(),
            self.hour,
            self.minute
        )
    }
}

fn parse_clock(value: &str) -> anyhow::Result<(u8, u8)> {
    let (hour, minute) = value
        .split_once(':')
        .with_context(|| format!("expected HH:MM, got {value:?}"))?;
    let hour: u8 = hour
        .parse()
        .with_context(|| format!("invalid hour in {value:?}"))?;
    let minute: u8 = minute
        .parse()
        .with_context(|| format!("invalid minute in {value:?}"))?;
    if hour > 23 || minute > 59 {
        anyhow::bail!("time out of range: {value:?}");
    }
    Ok((hour, minute))
}

fn first_of_month(year: i32, month: Month) -> Option<Date> {
    Date::from_calendar_date(year, month, 1).ok()
}

fn duration_until(now: OffsetDateTime, next: OffsetDateTime) -> Duration {
    let millis = (next - now).whole_milliseconds().max(0);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

fn format_timestamp(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}
