/// Drains now, or as soon as the pass already in progress has finished so
/// that a due item is not left waiting for the next wake-up.
async fn drain_when_idle(manager: &QueueManager) {
    loop {
        if manager.drain().await.is_some() || !manager.connectivity().is_online() {
            return;
        }
        tokio::time::sleep(BUSY_RETRY_DELAY).await;
    }
}

/// Drives drains outside of connectivity changes. Wakes at the earliest of
/// the drain timer, the next backoff deadline, the next database poll, or
/// an in-process enqueue, and drains when the timer fired or an item is due.
async fn run_scheduler(
    manager: Arc<QueueManager>,
    drain_interval: Duration,
    poll_interval: Duration,
    keep_synced: bool,
) {
    let mut next_timer = Instant::now() + drain_interval;
    loop {
        let next_due = if manager.connectivity().is_online() {
            next_due_at(&manager).await
        } else {
            None
        };
        let delay = scheduler_delay(
            now_millis(),
            next_due,
            next_timer.saturating_duration_since(Instant::now()),
            poll_interval,
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = manager.enqueued().notified() => {}
        }

        if Instant::now() >= next_timer {
            next_timer = Instant::now() + drain_interval;
            manager.on_timer_tick().await;
        } else if manager.connectivity().is_online()
            && next_due_at(&manager)
                .await
                .is_some_and(|at| at <= now_millis())
        {
            drain_when_idle(&manager).await;
        } else {
            continue;
        }
        settle_after_drain(&manager, keep_synced).await;
    }
}

async fn next_due_at(manager: &QueueManager) -> Option<i64> {
    match manager.store().next_due_at().await {
        Ok(due) => due,
        Err(err) => {
            tracing::warn!("failed to read queue schedule: {err}");
            None
        }
    }
}

fn scheduler_delay(
    now: i64,
    next_due_at: Option<i64>,
    until_timer: Duration,
    poll_interval: Duration,
) -> Duration {
    let mut delay = until_timer.min(poll_interval);
    if let Some(at) = next_due_at {
        let until_due = u64::try_from(at.saturating_sub(now)).unwrap_or(0);
        delay = delay.min(Duration::from_millis(until_due));
    }
    delay.max(BUSY_RETRY_DELAY)
}

async fn settle_after_drain(manager: &QueueManager, keep_synced: bool) {
    if keep_synced {
        return;
    }
    match manager.purge_synced().await {
        Ok(0) => {}
        Ok(purged) => tracing::debug!(purged, "synced items purged"),
        Err(err) => tracing::warn!("failed to purge synced items: {err}"),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn parse_u64_or(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool_or(value: Option<&str>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn clamp_concurrency(value: u64) -> usize {
    usize::try_from(value)
        .unwrap_or(MAX_DRAIN_CONCURRENCY)
        .clamp(1, MAX_DRAIN_CONCURRENCY)
}
