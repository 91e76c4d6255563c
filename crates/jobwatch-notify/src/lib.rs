//! Outbound notification dispatch and message formatting.
//!
//! The chat transport itself lives outside this workspace; everything here
//! talks to it through [`NotificationSink`], a best-effort ordered text
//! delivery seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{SalaryRange, VacancyRecord};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobwatch-notify";

/// How many listings are sent inline before the "show all" prompt.
pub const MAX_INLINE_NOTIFICATIONS: usize = 3;
/// Pause between consecutive messages of one batch, to stay under transport
/// throttling limits.
pub const MESSAGE_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport rejected message: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Action attached to a prompt message; the chat layer renders it as a
/// button and routes it back into the matching command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAction {
    ShowAllVacancies,
}

/// Ordered, best-effort text delivery to a numeric chat address.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), SinkError>;

    async fn send_action_prompt(
        &self,
        chat_id: i64,
        text: &str,
        action: PromptAction,
    ) -> Result<(), SinkError>;
}

/// Outcome of dispatching one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Sends a summary, up to [`MAX_INLINE_NOTIFICATIONS`] annotated listings in
/// input order, and a "show all" prompt when the batch is larger. A failed
/// send is logged and the rest of the batch is still attempted; nothing here
/// raises past the dispatcher boundary.
pub struct Dispatcher {
    sink: Arc<dyn NotificationSink>,
    max_inline: usize,
    message_pause: Duration,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            max_inline: MAX_INLINE_NOTIFICATIONS,
            message_pause: MESSAGE_PAUSE,
        }
    }

    /// Test hook: drop the inter-message pause.
    pub fn with_message_pause(mut self, pause: Duration) -> Self {
        self.message_pause = pause;
        self
    }

    pub async fn notify(
        &self,
        chat_id: i64,
        vacancies: &[VacancyRecord],
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if vacancies.is_empty() {
            return report;
        }

        let summary = format!(
            "🔔 Найдено {} новых вакансий!\n\nВот самые свежие из них:",
            vacancies.len()
        );
        self.send(chat_id, &summary, &mut report).await;

        let inline = vacancies.len().min(self.max_inline);
        for (index, vacancy) in vacancies.iter().take(inline).enumerate() {
            tokio::time::sleep(self.message_pause).await;
            let text = format!(
                "Вакансия {} из {}\n\n{}",
                index + 1,
                inline,
                format_vacancy(vacancy, now)
            );
            self.send(chat_id, &text, &mut report).await;
        }

        if vacancies.len() > self.max_inline {
            tokio::time::sleep(self.message_pause).await;
            let prompt = format!(
                "📊 Всего найдено {} новых вакансий.\nНажмите кнопку ниже, чтобы увидеть все результаты.",
                vacancies.len()
            );
            match self
                .sink
                .send_action_prompt(chat_id, &prompt, PromptAction::ShowAllVacancies)
                .await
            {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    warn!(chat_id, error = %err, "failed to send show-all prompt");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn send(&self, chat_id: i64, text: &str, report: &mut DispatchReport) {
        match self.sink.send_message(chat_id, text).await {
            Ok(()) => report.sent += 1,
            Err(err) => {
                warn!(chat_id, error = %err, "failed to send notification message");
                report.failed += 1;
            }
        }
    }
}

/// One listing rendered for delivery.
pub fn format_vacancy(vacancy: &VacancyRecord, now: DateTime<Utc>) -> String {
    format!(
        "💼 {}\n\n🏢 Компания: {}\n💰 Зарплата: {}\n📍 Местоположение: {}\n📊 Опыт: {}\n🕓 Опубликовано: {}\n🔗 {}",
        vacancy.title,
        vacancy.employer.as_deref().unwrap_or("не указана"),
        format_salary(vacancy.salary.as_ref()),
        vacancy.area.as_deref().unwrap_or("не указано"),
        vacancy.experience.as_deref().unwrap_or("не указан"),
        format_relative_age(vacancy.published_at, now),
        vacancy.url,
    )
}

pub fn format_salary(salary: Option<&SalaryRange>) -> String {
    match salary {
        Some(SalaryRange {
            from: Some(from),
            to: Some(to),
            currency,
        }) => format!(
            "{} - {} {}",
            format_thousands(*from),
            format_thousands(*to),
            currency
        ),
        Some(SalaryRange {
            from: Some(from),
            to: None,
            currency,
        }) => format!("от {} {}", format_thousands(*from), currency),
        Some(SalaryRange {
            from: None,
            to: Some(to),
            currency,
        }) => format!("до {} {}", format_thousands(*to), currency),
        _ => "не указана".to_string(),
    }
}

/// Space-grouped thousands: 1234567 → "1 234 567".
pub fn format_thousands(value: i64) -> String {
    let digits = value.abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// Human-relative publication age, computed in UTC. Over 30 days renders a
/// calendar date; a missing or malformed timestamp renders a generic word
/// instead of failing the whole message.
pub fn format_relative_age(published_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(published) = published_at else {
        return "недавно".to_string();
    };

    let elapsed = now.signed_duration_since(published);
    if elapsed < chrono::Duration::zero() {
        return "только что".to_string();
    }
    if elapsed.num_days() > 30 {
        return published.format("%d.%m.%Y").to_string();
    }

    let days = elapsed.num_days();
    if days >= 1 {
        return format!("{days} {} назад", ru_plural(days, "день", "дня", "дней"));
    }
    let hours = elapsed.num_hours();
    if hours >= 1 {
        return format!("{hours} {} назад", ru_plural(hours, "час", "часа", "часов"));
    }
    let minutes = elapsed.num_minutes();
    if minutes >= 1 {
        return format!(
            "{minutes} {} назад",
            ru_plural(minutes, "минута", "минуты", "минут")
        );
    }
    "только что".to_string()
}

/// Russian plural form selection: 1 → one, 2–4 → few, otherwise many, with
/// the 11–14 exception.
pub fn ru_plural<'a>(n: i64, one: &'a str, few: &'a str, many: &'a str) -> &'a str {
    let n = n.abs();
    if (11..=14).contains(&(n % 100)) {
        return many;
    }
    match n % 10 {
        1 => one,
        2..=4 => few,
        _ => many,
    }
}

/// What kind of free-text input the chat layer is waiting for from a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInput {
    Profession,
    SalaryMin,
    Area,
}

/// Explicit per-user conversation state with TTL expiry. Replaces the ad hoc
/// unbounded user→mode mapping: stale prompts silently lapse instead of
/// capturing unrelated text forever.
#[derive(Debug)]
pub struct ConversationTracker {
    ttl: chrono::Duration,
    entries: Mutex<HashMap<i64, (PendingInput, DateTime<Utc>)>>,
}

impl ConversationTracker {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn expect(&self, user_id: i64, input: PendingInput, now: DateTime<Utc>) {
        self.entries.lock().unwrap().insert(user_id, (input, now));
    }

    /// Consume the pending state if present and not expired.
    pub fn take(&self, user_id: i64, now: DateTime<Utc>) -> Option<PendingInput> {
        let mut entries = self.entries.lock().unwrap();
        let (input, asked_at) = entries.remove(&user_id)?;
        if now.signed_duration_since(asked_at) > self.ttl {
            return None;
        }
        Some(input)
    }

    pub fn clear(&self, user_id: i64) {
        self.entries.lock().unwrap().remove(&user_id);
    }

    /// Drop all expired entries; returns how many were removed.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, (_, asked_at)| now.signed_duration_since(*asked_at) <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Stdout sink used by the CLI when no chat transport is wired in.
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl NotificationSink for ConsoleSink {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), SinkError> {
        println!("[chat {chat_id}]\n{text}\n");
        Ok(())
    }

    async fn send_action_prompt(
        &self,
        chat_id: i64,
        text: &str,
        action: PromptAction,
    ) -> Result<(), SinkError> {
        println!("[chat {chat_id}] ({action:?})\n{text}\n");
        Ok(())
    }
}

/// Recorded outbound message, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub action: Option<PromptAction>,
}

/// Recording sink double. Can be told to fail sends whose text contains a
/// marker, and to delay each send (to exercise in-flight tick behavior).
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<SentMessage>>,
    fail_marker: Option<String>,
    send_delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            fail_marker: Some(marker.into()),
            ..Self::default()
        }
    }

    pub fn with_send_delay(delay: Duration) -> Self {
        Self {
            send_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().unwrap().clone()
    }

    async fn record(
        &self,
        chat_id: i64,
        text: &str,
        action: Option<PromptAction>,
    ) -> Result<(), SinkError> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(SinkError::Rejected(format!("marker {marker:?} hit")));
            }
        }
        self.messages.lock().unwrap().push(SentMessage {
            chat_id,
            text: text.to_string(),
            action,
        });
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), SinkError> {
        self.record(chat_id, text, None).await
    }

    async fn send_action_prompt(
        &self,
        chat_id: i64,
        text: &str,
        action: PromptAction,
    ) -> Result<(), SinkError> {
        self.record(chat_id, text, Some(action)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn vacancy(id: &str, title: &str) -> VacancyRecord {
        VacancyRecord {
            id: id.to_string(),
            title: title.to_string(),
            employer: Some("ООО Ромашка".to_string()),
            area: Some("Москва".to_string()),
            experience: Some("От 1 года до 3 лет".to_string()),
            salary: Some(SalaryRange {
                from: Some(100_000),
                to: Some(150_000),
                currency: "RUR".to_string(),
            }),
            published_at: None,
            url: format!("https://hh.ru/vacancy/{id}"),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn dispatcher(sink: Arc<RecordingSink>) -> Dispatcher {
        Dispatcher::new(sink).with_message_pause(Duration::ZERO)
    }

    #[tokio::test]
    async fn batch_of_five_sends_summary_three_listings_and_prompt() {
        let sink = Arc::new(RecordingSink::new());
        let batch: Vec<_> = (1..=5).map(|i| vacancy(&i.to_string(), "Инженер")).collect();

        let report = dispatcher(sink.clone()).notify(7, &batch, now()).await;

        let messages = sink.messages();
        assert_eq!(report, DispatchReport { sent: 5, failed: 0 });
        assert_eq!(messages.len(), 5);
        assert!(messages[0].text.contains("Найдено 5 новых вакансий"));
        assert!(messages[1].text.starts_with("Вакансия 1 из 3"));
        assert!(messages[2].text.starts_with("Вакансия 2 из 3"));
        assert!(messages[3].text.starts_with("Вакансия 3 из 3"));
        assert_eq!(messages[4].action, Some(PromptAction::ShowAllVacancies));
        assert!(messages.iter().all(|m| m.chat_id == 7));
    }

    #[tokio::test]
    async fn small_batch_has_no_prompt_and_caps_to_batch_size() {
        let sink = Arc::new(RecordingSink::new());
        let batch = vec![vacancy("1", "Инженер"), vacancy("2", "Аналитик")];

        dispatcher(sink.clone()).notify(7, &batch, now()).await;

        let messages = sink.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[1].text.starts_with("Вакансия 1 из 2"));
        assert!(messages.iter().all(|m| m.action.is_none()));
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let sink = Arc::new(RecordingSink::new());
        let report = dispatcher(sink.clone()).notify(7, &[], now()).await;
        assert_eq!(report, DispatchReport::default());
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn one_failed_message_does_not_abort_the_batch() {
        let sink = Arc::new(RecordingSink::failing_on("Вакансия 2 из 3"));
        let batch: Vec<_> = (1..=5).map(|i| vacancy(&i.to_string(), "Инженер")).collect();

        let report = dispatcher(sink.clone()).notify(7, &batch, now()).await;

        assert_eq!(report, DispatchReport { sent: 4, failed: 1 });
        let messages = sink.messages();
        assert_eq!(messages.len(), 4);
        assert!(messages[2].text.starts_with("Вакансия 3 из 3"));
        assert_eq!(messages[3].action, Some(PromptAction::ShowAllVacancies));
    }

    #[test]
    fn salary_formats_cover_all_bound_combinations() {
        let range = |from, to| SalaryRange {
            from,
            to,
            currency: "RUR".to_string(),
        };
        assert_eq!(
            format_salary(Some(&range(Some(100_000), Some(150_000)))),
            "100 000 - 150 000 RUR"
        );
        assert_eq!(format_salary(Some(&range(Some(100_000), None))), "от 100 000 RUR");
        assert_eq!(format_salary(Some(&range(None, Some(90_000)))), "до 90 000 RUR");
        assert_eq!(format_salary(Some(&range(None, None))), "не указана");
        assert_eq!(format_salary(None), "не указана");
    }

    #[test]
    fn thousands_grouping_uses_spaces() {
        assert_eq!(format_thousands(999), "999");
        assert_eq!(format_thousands(1_000), "1 000");
        assert_eq!(format_thousands(1_234_567), "1 234 567");
    }

    #[test]
    fn relative_age_inflects_and_falls_back_to_dates() {
        let now = now();
        let ago = |d: ChronoDuration| Some(now - d);

        assert_eq!(format_relative_age(ago(ChronoDuration::hours(1)), now), "1 час назад");
        assert_eq!(format_relative_age(ago(ChronoDuration::hours(2)), now), "2 часа назад");
        assert_eq!(format_relative_age(ago(ChronoDuration::hours(5)), now), "5 часов назад");
        assert_eq!(format_relative_age(ago(ChronoDuration::days(11)), now), "11 дней назад");
        assert_eq!(format_relative_age(ago(ChronoDuration::days(21)), now), "21 день назад");
        assert_eq!(
            format_relative_age(ago(ChronoDuration::minutes(3)), now),
            "3 минуты назад"
        );
        assert_eq!(format_relative_age(ago(ChronoDuration::seconds(20)), now), "только что");
        assert_eq!(
            format_relative_age(ago(ChronoDuration::days(40)), now),
            "20.01.2026"
        );
        assert_eq!(format_relative_age(None, now), "недавно");
    }

    #[test]
    fn conversation_state_expires_after_ttl() {
        let tracker = ConversationTracker::new(ChronoDuration::minutes(10));
        let t0 = now();

        tracker.expect(1, PendingInput::SalaryMin, t0);
        assert_eq!(
            tracker.take(1, t0 + ChronoDuration::minutes(5)),
            Some(PendingInput::SalaryMin)
        );
        // Consumed: a second take finds nothing.
        assert_eq!(tracker.take(1, t0 + ChronoDuration::minutes(5)), None);

        tracker.expect(2, PendingInput::Area, t0);
        assert_eq!(tracker.take(2, t0 + ChronoDuration::minutes(11)), None);

        tracker.expect(3, PendingInput::Profession, t0);
        assert_eq!(tracker.expire_stale(t0 + ChronoDuration::hours(1)), 1);
        assert!(tracker.is_empty());
    }
}
