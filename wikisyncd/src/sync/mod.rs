pub mod backoff;
pub mod catalog;
pub mod engine;
pub mod governor;
pub mod paths;
pub mod planner;
pub mod retention;
pub mod state;
pub mod store;
pub mod transfer;
pub mod unpack;

use time::OffsetDateTime;

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
