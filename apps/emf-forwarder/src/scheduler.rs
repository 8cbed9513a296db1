use crate::connection::Connections;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// First instant strictly after `now` that is a whole multiple of `interval` since the epoch.
pub fn next_aligned_tick(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_ms = (interval.as_millis() as i64).max(1);
    let next_ms = (now.timestamp_millis().div_euclid(interval_ms) + 1) * interval_ms;
    Utc.timestamp_millis_opt(next_ms)
        .single()
        .unwrap_or(now + chrono::Duration::milliseconds(interval_ms))
}

/// Next boundary after both `now` and the previous tick, so a clock stepping backwards
/// never repeats a boundary.
pub fn following_tick(now: DateTime<Utc>, last: Option<DateTime<Utc>>, interval: Duration) -> DateTime<Utc> {
    let from = last.map_or(now, |last| last.max(now));
    next_aligned_tick(from, interval)
}

/// Ticks every connection once per aligned interval. Runs until the task is dropped.
pub async fn run_scheduler(connections: Arc<Connections>, clock: Arc<dyn Clock>, interval: Duration) {
    let mut last_tick = None;
    loop {
        let now = clock.now();
        let tick_at = following_tick(now, last_tick, interval);
        let wait = (tick_at - now).to_std().unwrap_or_default();
        tracing::debug!(%tick_at, wait_ms = wait.as_millis() as u64, "waiting for next tick");
        tokio::time::sleep(wait).await;

        run_tick(&connections, tick_at).await;
        last_tick = Some(tick_at);
    }
}

/// Runs one tick on all connections concurrently and waits for all of them.
pub async fn run_tick(connections: &Connections, tick_at: DateTime<Utc>) {
    let results = join_all(connections.iter().map(|handle| async move {
        (handle.id().to_string(), handle.tick(tick_at).await)
    }))
    .await;
    for (connection_id, result) in results {
        if let Err(err) = result {
            tracing::error!(connection = %connection_id, error=%err, "tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn aligns_to_interval_boundaries() {
        let five = Duration::from_secs(300);
        assert_eq!(next_aligned_tick(at(12, 3, 17), five), at(12, 5, 0));
        assert_eq!(next_aligned_tick(at(12, 5, 0), five), at(12, 10, 0));
        assert_eq!(next_aligned_tick(at(23, 59, 59), five), Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap());
        assert_eq!(next_aligned_tick(at(12, 0, 1), Duration::from_secs(900)), at(12, 15, 0));
    }

    #[test]
    fn early_wakeup_does_not_repeat_a_tick() {
        let five = Duration::from_secs(300);
        let early = at(12, 4, 59) + chrono::Duration::milliseconds(900);

        assert_eq!(next_aligned_tick(early, five), at(12, 5, 0));
        assert_eq!(following_tick(early, Some(at(12, 5, 0)), five), at(12, 10, 0));
        assert_eq!(following_tick(at(11, 58, 0), Some(at(12, 5, 0)), five), at(12, 10, 0));
        assert_eq!(following_tick(at(12, 7, 30), Some(at(12, 5, 0)), five), at(12, 10, 0));
        assert_eq!(following_tick(at(12, 3, 17), None, five), at(12, 5, 0));
    }

    #[test]
    fn zero_interval_still_moves_forward() {
        let now = at(12, 0, 0);
        assert!(next_aligned_tick(now, Duration::ZERO) > now);
    }
}
