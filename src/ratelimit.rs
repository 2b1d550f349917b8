use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_RPM_LIMIT: u32 = 15;
pub const DEFAULT_DAILY_LIMIT: u32 = 1500;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Window {
    minute: MinuteBucket,
    day: DayBucket,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MinuteBucket {
    start: i64,
    count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DayBucket {
    date: NaiveDate,
    count: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum Reservation {
    Granted,
    MinuteFull { retry_in: Duration },
    DayExhausted,
}

/// Persistent request budget shared across processes. The window file is the
/// only cross-process state in the system; every read-modify-write happens
/// under an exclusive flock.
pub struct RateLimiter {
    path: PathBuf,
    rpm: u32,
    daily: u32,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(path: &Path, rpm: u32, daily: u32, max_wait: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            rpm,
            daily,
            max_wait,
        }
    }

    /// Reserves one request slot, waiting up to `max_wait` for the minute
    /// window to roll over. The daily budget is never waited on.
    pub async fn reserve(&self) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            match self.try_reserve(Utc::now())? {
                Reservation::Granted => return Ok(()),
                Reservation::DayExhausted => {
                    warn!("Daily content budget of {} requests is spent", self.daily);
                    return Err(Error::QuotaExceeded);
                }
                Reservation::MinuteFull { retry_in } => {
                    if Instant::now() + retry_in > deadline {
                        return Err(Error::QuotaExceeded);
                    }
                    debug!("Minute budget full, waiting {retry_in:?} for a slot");
                    tokio::time::sleep(retry_in).await;
                }
            }
        }
    }

    fn try_reserve(&self, now: DateTime<Utc>) -> Result<Reservation> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let outcome = self.reserve_locked(&mut file, now);
        let _ = FileExt::unlock(&file);
        outcome
    }

    fn reserve_locked(&self, file: &mut fs::File, now: DateTime<Utc>) -> Result<Reservation> {
        let mut raw = String::new();
        file.read_to_string(&mut raw)?;
        let mut window: Window = serde_json::from_str(&raw).unwrap_or_default();

        let minute_start = now.timestamp() - now.timestamp().rem_euclid(60);
        if window.minute.start != minute_start {
            window.minute = MinuteBucket {
                start: minute_start,
                count: 0,
            };
        }
        let today = now.date_naive();
        if window.day.date != today {
            window.day = DayBucket {
                date: today,
                count: 0,
            };
        }

        if window.day.count >= self.daily {
            return Ok(Reservation::DayExhausted);
        }
        if window.minute.count >= self.rpm {
            let until_rollover = (minute_start + 60 - now.timestamp()).max(1);
            return Ok(Reservation::MinuteFull {
                retry_in: Duration::from_secs(until_rollover as u64),
            });
        }

        window.minute.count += 1;
        window.day.count += 1;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string_pretty(&window)?.as_bytes())?;
        Ok(Reservation::Granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter(dir: &Path, rpm: u32, daily: u32) -> RateLimiter {
        RateLimiter::new(&dir.join("window.json"), rpm, daily, DEFAULT_MAX_WAIT)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn grants_up_to_the_minute_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(dir.path(), 3, 100);

        for _ in 0..3 {
            assert_eq!(
                limiter.try_reserve(at(1_000_000)).expect("io ok"),
                Reservation::Granted
            );
        }
        match limiter.try_reserve(at(1_000_000)).expect("io ok") {
            Reservation::MinuteFull { retry_in } => assert!(retry_in <= Duration::from_secs(60)),
            other => panic!("expected a full minute, got {other:?}"),
        }
    }

    #[test]
    fn minute_rollover_frees_the_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(dir.path(), 1, 100);

        assert_eq!(
            limiter.try_reserve(at(1_000_000)).expect("io ok"),
            Reservation::Granted
        );
        assert!(matches!(
            limiter.try_reserve(at(1_000_001)).expect("io ok"),
            Reservation::MinuteFull { .. }
        ));
        assert_eq!(
            limiter.try_reserve(at(1_000_060)).expect("io ok"),
            Reservation::Granted
        );
    }

    #[test]
    fn day_budget_is_terminal_within_the_day() {
        let dir = tempfile::tempdir().expect("tempdir");
        let limiter = limiter(dir.path(), 100, 2);

        assert_eq!(
            limiter.try_reserve(at(1_000_000)).expect("io ok"),
            Reservation::Granted
        );
        assert_eq!(
            limiter.try_reserve(at(1_000_060)).expect("io ok"),
            Reservation::Granted
        );
        assert_eq!(
            limiter.try_reserve(at(1_000_120)).expect("io ok"),
            Reservation::DayExhausted
        );
        // next day is a fresh budget
        assert_eq!(
            limiter.try_reserve(at(1_000_000 + 86_400)).expect("io ok"),
            Reservation::Granted
        );
    }

    #[test]
    fn window_survives_a_new_limiter_instance() {
        let dir = tempfile::tempdir().expect("tempdir");

        assert_eq!(
            limiter(dir.path(), 1, 100).try_reserve(at(1_000_000)).expect("io ok"),
            Reservation::Granted
        );
        assert!(matches!(
            limiter(dir.path(), 1, 100).try_reserve(at(1_000_001)).expect("io ok"),
            Reservation::MinuteFull { .. }
        ));
    }

    #[test]
    fn corrupt_window_file_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("window.json");
        fs::write(&path, "not json at all").expect("write fixture");

        let limiter = RateLimiter::new(&path, 1, 100, DEFAULT_MAX_WAIT);
        assert_eq!(
            limiter.try_reserve(at(1_000_000)).expect("io ok"),
            Reservation::Granted
        );
    }

    #[test]
    fn racing_reservations_never_exceed_the_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("window.json");

        let mut workers = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            workers.push(std::thread::spawn(move || {
                let limiter = RateLimiter::new(&path, 10, 100, DEFAULT_MAX_WAIT);
                let mut granted = 0;
                for _ in 0..5 {
                    if limiter.try_reserve(at(1_000_000)).expect("io ok") == Reservation::Granted {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let granted: u32 = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker finishes"))
            .sum();
        assert_eq!(granted, 10);

        let window: Window =
            serde_json::from_str(&fs::read_to_string(&path).expect("window exists"))
                .expect("valid json");
        assert_eq!(window.minute.count, 10);
    }

    #[test]
    fn written_window_is_valid_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("window.json");
        let limiter = RateLimiter::new(&path, 5, 100, DEFAULT_MAX_WAIT);
        limiter.try_reserve(at(1_000_030)).expect("io ok");

        let raw = fs::read_to_string(&path).expect("window exists");
        let window: Window = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(window.minute.count, 1);
        assert_eq!(window.minute.start, 1_000_020);
        assert_eq!(window.day.count, 1);
    }
}
