//! Scheduling engine: periodic per-user vacancy checks with deduplication.
//!
//! One recurring job enumerates active users, runs each through
//! filter-normalize → search → dedup-filter → dispatch, and records what was
//! delivered. Ticks never overlap; reconfiguration only affects future
//! scheduling, never an in-flight pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobwatch_client::VacancyProvider;
use jobwatch_core::{FilterNormalizer, UserAccount, VacancyRecord};
use jobwatch_notify::Dispatcher;
use jobwatch_storage::{DeliveryStore, FilterStore, UserStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-engine";

/// Floor enforced by the command layer; the engine itself accepts any
/// positive interval.
pub const MIN_INTERVAL_MINUTES: u64 = 5;
/// Pause between users within one pass, to stay within the search API's
/// rate expectations.
pub const USER_PAUSE: Duration = Duration::from_secs(1);
/// Retention window for the durable delivery history.
pub const LEDGER_RETENTION_DAYS: i64 = 7;

/// Per-user record of listing ids already delivered. The in-process
/// authority for "is this listing new"; sets grow monotonically while the
/// process runs and survive stop/start cycles.
#[derive(Debug, Default)]
pub struct DeduplicationLedger {
    seen: HashMap<i64, HashSet<String>>,
}

impl DeduplicationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_user(&mut self, user_id: i64) {
        self.seen.entry(user_id).or_default();
    }

    pub fn hydrate(&mut self, user_id: i64, listing_ids: impl IntoIterator<Item = String>) {
        self.seen.entry(user_id).or_default().extend(listing_ids);
    }

    pub fn is_new(&self, user_id: i64, listing_id: &str) -> bool {
        !self
            .seen
            .get(&user_id)
            .is_some_and(|ids| ids.contains(listing_id))
    }

    pub fn mark_delivered(&mut self, user_id: i64, listing_id: impl Into<String>) {
        self.seen
            .entry(user_id)
            .or_default()
            .insert(listing_id.into());
    }

    pub fn users_tracked(&self) -> usize {
        self.seen.len()
    }

    pub fn seen_count(&self, user_id: i64) -> usize {
        self.seen.get(&user_id).map_or(0, HashSet::len)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub user_pause: Duration,
    pub retention: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            user_pause: USER_PAUSE,
            retention: chrono::Duration::days(LEDGER_RETENTION_DAYS),
        }
    }
}

/// Result of one full pass over all active users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub users_checked: usize,
    pub users_skipped: usize,
    pub users_failed: usize,
    pub notified: usize,
}

/// Read-only scheduling snapshot; safe to request while a pass is running
/// or while start/stop executes.
#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub running: bool,
    pub interval_minutes: u64,
    pub next_run: Option<DateTime<Utc>>,
    pub users_tracked: usize,
    pub job_count: usize,
}

#[derive(Debug, Default)]
struct ScheduleState {
    running: bool,
    interval_minutes: u64,
    job_id: Option<Uuid>,
}

struct EngineCore {
    search: Arc<dyn VacancyProvider>,
    users: Arc<dyn UserStore>,
    filters: Arc<dyn FilterStore>,
    deliveries: Arc<dyn DeliveryStore>,
    dispatcher: Dispatcher,
    normalizer: FilterNormalizer,
    ledger: Mutex<DeduplicationLedger>,
    tick_lock: Mutex<()>,
    user_pause: Duration,
}

impl EngineCore {
    /// Seed one (possibly empty) set per known user and hydrate it from the
    /// durable delivery history, so a restart does not re-notify listings
    /// delivered within the retention window. Store failures degrade to an
    /// empty snapshot instead of blocking the scheduler.
    async fn prepare_ledger(&self, retention: chrono::Duration) {
        let cutoff = Utc::now() - retention;

        if let Err(err) = self.deliveries.prune_delivered_before(cutoff).await {
            warn!(error = %err, "could not prune delivery history");
        }

        let users = match self.users.list_active_users().await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "could not load users for ledger snapshot");
                return;
            }
        };

        let mut ledger = self.ledger.lock().await;
        for user in &users {
            ledger.seed_user(user.id);
            match self.deliveries.delivered_since(user.id, cutoff).await {
                Ok(ids) => ledger.hydrate(user.id, ids),
                Err(err) => {
                    warn!(user_id = user.id, error = %err, "could not hydrate delivery history")
                }
            }
        }
        info!(users = users.len(), "deduplication ledger seeded");
    }

    /// One full pass. Returns `None` when a previous pass is still in
    /// flight; overlapping passes are skipped, never queued.
    async fn run_pass(&self) -> Option<PassSummary> {
        let run_id = Uuid::new_v4();
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!(%run_id, "previous check pass still in flight, skipping tick");
            return None;
        };

        let started_at = Utc::now();
        let users = match self.users.list_active_users().await {
            Ok(users) => users,
            Err(err) => {
                error!(%run_id, error = %err, "cannot enumerate active users, aborting pass");
                return Some(PassSummary {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    users_checked: 0,
                    users_skipped: 0,
                    users_failed: 0,
                    notified: 0,
                });
            }
        };
        debug!(%run_id, users = users.len(), "starting vacancy check pass");

        let mut users_checked = 0;
        let mut users_skipped = 0;
        let mut users_failed = 0;
        let mut notified = 0;

        for user in &users {
            match self.check_user(user).await {
                Ok(Some(count)) => {
                    users_checked += 1;
                    notified += count;
                }
                Ok(None) => users_skipped += 1,
                Err(err) => {
                    users_failed += 1;
                    error!(%run_id, user_id = user.id, error = %err, "per-user check failed");
                }
            }
            tokio::time::sleep(self.user_pause).await;
        }

        let summary = PassSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            users_checked,
            users_skipped,
            users_failed,
            notified,
        };
        info!(
            %run_id,
            checked = summary.users_checked,
            skipped = summary.users_skipped,
            failed = summary.users_failed,
            notified = summary.notified,
            "vacancy check pass finished"
        );
        Some(summary)
    }

    /// Check one user: fresh filters → background query → search →
    /// dedup-filter → dispatch → ledger update. Returns `None` when the user
    /// has no filters configured, `Some(n)` with the number of new listings
    /// delivered otherwise.
    async fn check_user(&self, user: &UserAccount) -> Result<Option<usize>> {
        let filters = self
            .filters
            .filters(user.id)
            .await
            .with_context(|| format!("loading filters for user {}", user.id))?;
        if filters.is_empty() {
            debug!(user_id = user.id, "no filters configured, skipping");
            return Ok(None);
        }

        let now = Utc::now();
        let query = self.normalizer.background_query(&filters, now);
        let vacancies = self.search.search(&query).await;
        if vacancies.is_empty() {
            debug!(user_id = user.id, "no listings returned this check");
            return Ok(Some(0));
        }

        let fresh: Vec<VacancyRecord> = {
            let ledger = self.ledger.lock().await;
            vacancies
                .into_iter()
                .filter(|v| ledger.is_new(user.id, &v.id))
                .collect()
        };
        if fresh.is_empty() {
            debug!(user_id = user.id, "all returned listings already delivered");
            return Ok(Some(0));
        }

        // The whole batch is marked delivered once it has been handed to the
        // dispatcher; a transport failure after this point is not retried.
        let report = self.dispatcher.notify(user.chat_id, &fresh, now).await;

        let ids: Vec<String> = fresh.iter().map(|v| v.id.clone()).collect();
        {
            let mut ledger = self.ledger.lock().await;
            for id in &ids {
                ledger.mark_delivered(user.id, id.clone());
            }
        }
        if let Err(err) = self.deliveries.record_delivered(user.id, &ids, now).await {
            warn!(user_id = user.id, error = %err, "could not persist delivery history");
        }

        info!(
            user_id = user.id,
            new = ids.len(),
            sent = report.sent,
            failed = report.failed,
            "notified user about new listings"
        );
        Ok(Some(ids.len()))
    }
}

/// The scheduling engine. States are Stopped and Running; `start` while
/// Running atomically replaces the recurring job instead of adding a second
/// one, and `stop` never clears the ledger.
pub struct SchedulerService {
    scheduler: JobScheduler,
    core: Arc<EngineCore>,
    state: Mutex<ScheduleState>,
    retention: chrono::Duration,
}

impl SchedulerService {
    /// Construction is the only fatal point of the engine: if the underlying
    /// job scheduler cannot be created or started there is nothing to run.
    pub async fn new(
        search: Arc<dyn VacancyProvider>,
        users: Arc<dyn UserStore>,
        filters: Arc<dyn FilterStore>,
        deliveries: Arc<dyn DeliveryStore>,
        dispatcher: Dispatcher,
        normalizer: FilterNormalizer,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating job scheduler")?;
        scheduler.start().await.context("starting job scheduler")?;

        Ok(Self {
            scheduler,
            core: Arc::new(EngineCore {
                search,
                users,
                filters,
                deliveries,
                dispatcher,
                normalizer,
                ledger: Mutex::new(DeduplicationLedger::new()),
                tick_lock: Mutex::new(()),
                user_pause: config.user_pause,
            }),
            state: Mutex::new(ScheduleState::default()),
            retention: config.retention,
        })
    }

    /// Begin (or re-begin) recurring checks at the given interval. Also
    /// triggers one immediate out-of-band pass so the first results do not
    /// wait a full interval.
    pub async fn start(&self, interval_minutes: u64) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(job_id) = state.job_id.take() {
            self.scheduler
                .remove(&job_id)
                .await
                .context("removing previous check job")?;
        }
        if !state.running {
            self.core.prepare_ledger(self.retention).await;
        }

        let job_core = Arc::clone(&self.core);
        let job = Job::new_repeated_async(
            Duration::from_secs(interval_minutes * 60),
            move |_job_id, _scheduler| {
                let core = Arc::clone(&job_core);
                Box::pin(async move {
                    let _ = core.run_pass().await;
                })
            },
        )
        .context("creating check job")?;
        let job_id = self
            .scheduler
            .add(job)
            .await
            .context("scheduling check job")?;

        state.job_id = Some(job_id);
        state.interval_minutes = interval_minutes;
        state.running = true;
        info!(interval_minutes, "scheduler running");

        let immediate = Arc::clone(&self.core);
        tokio::spawn(async move {
            let _ = immediate.run_pass().await;
        });
        Ok(())
    }

    /// Cancel the recurring job. An in-flight pass is never cancelled, and
    /// the ledger keeps its history for the next start.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job_id) = state.job_id.take() {
            self.scheduler
                .remove(&job_id)
                .await
                .context("removing check job")?;
            info!("scheduler stopped");
        }
        state.running = false;
        Ok(())
    }

    /// Change the interval: replaces the recurring job when Running, or just
    /// records the new value when Stopped.
    pub async fn set_interval(&self, interval_minutes: u64) -> Result<()> {
        let running = self.state.lock().await.running;
        if running {
            self.start(interval_minutes).await
        } else {
            self.state.lock().await.interval_minutes = interval_minutes;
            Ok(())
        }
    }

    pub async fn status(&self) -> ScheduleStatus {
        let state = self.state.lock().await;
        let next_run = match state.job_id {
            Some(job_id) => {
                let mut scheduler = self.scheduler.clone();
                scheduler.next_tick_for_job(job_id).await.ok().flatten()
            }
            None => None,
        };
        let users_tracked = self.core.ledger.lock().await.users_tracked();

        ScheduleStatus {
            running: state.running,
            interval_minutes: state.interval_minutes,
            next_run,
            users_tracked,
            job_count: usize::from(state.job_id.is_some()),
        }
    }

    /// Run one pass outside the recurring schedule (on-demand checks, the
    /// immediate pass after `start`). `None` means a pass was already in
    /// flight and this one was skipped.
    pub async fn run_pass(&self) -> Option<PassSummary> {
        self.core.run_pass().await
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("check interval must be at least 5 minutes, got {requested}")]
    IntervalTooShort { requested: u64 },
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Caller-facing command surface for the chat layer: validates input before
/// it reaches the engine and renders replies as user-visible text.
pub struct BotCommands {
    service: Arc<SchedulerService>,
}

impl BotCommands {
    pub fn new(service: Arc<SchedulerService>) -> Self {
        Self { service }
    }

    fn validate_interval(interval_minutes: u64) -> Result<(), CommandError> {
        if interval_minutes < MIN_INTERVAL_MINUTES {
            return Err(CommandError::IntervalTooShort {
                requested: interval_minutes,
            });
        }
        Ok(())
    }

    pub async fn start(&self, interval_minutes: u64) -> Result<String, CommandError> {
        Self::validate_interval(interval_minutes)?;
        self.service.start(interval_minutes).await?;
        Ok(format!(
            "✅ Автопоиск запущен. Интервал проверки: {interval_minutes} мин."
        ))
    }

    pub async fn set_interval(&self, interval_minutes: u64) -> Result<String, CommandError> {
        Self::validate_interval(interval_minutes)?;
        self.service.set_interval(interval_minutes).await?;
        Ok(format!(
            "✅ Интервал проверки обновлён: {interval_minutes} мин."
        ))
    }

    pub async fn stop(&self) -> Result<String, CommandError> {
        self.service.stop().await?;
        Ok("🛑 Автопоиск остановлен".to_string())
    }

    pub async fn status_text(&self) -> String {
        let status = self.service.status().await;
        let next_run = status
            .next_run
            .map(|ts| ts.format("%d.%m.%Y %H:%M UTC").to_string())
            .unwrap_or_else(|| "—".to_string());
        format!(
            "📊 Автопоиск: {}\n⏰ Интервал: {} мин.\n▶️ Следующая проверка: {}\n👥 Пользователей отслеживается: {}",
            if status.running { "включён" } else { "выключен" },
            status.interval_minutes,
            next_run,
            status.users_tracked,
        )
    }
}
