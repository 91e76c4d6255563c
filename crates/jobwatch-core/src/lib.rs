//! Core domain model and filter normalization for JobWatch.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "jobwatch-core";

/// Page size forced onto scheduler-driven queries.
pub const BACKGROUND_PAGE_SIZE: u8 = 10;
/// Trailing window for scheduler-driven queries, in hours.
pub const BACKGROUND_WINDOW_HOURS: i64 = 24;
/// Stored area value that means "remote work" instead of a location.
pub const REMOTE_AREA_SENTINEL: &str = "remote";

/// A bot user: opaque account id plus the numeric chat address used for
/// delivery. Accounts are created on first interaction and only ever
/// deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub chat_id: i64,
    pub first_name: Option<String>,
    pub username: Option<String>,
    pub active: bool,
}

/// The fixed set of filter keys a user can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilterKey {
    Profession,
    SalaryMin,
    Experience,
    Schedule,
    Employment,
    Area,
}

impl FilterKey {
    pub const ALL: [FilterKey; 6] = [
        FilterKey::Profession,
        FilterKey::SalaryMin,
        FilterKey::Experience,
        FilterKey::Schedule,
        FilterKey::Employment,
        FilterKey::Area,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKey::Profession => "profession",
            FilterKey::SalaryMin => "salary_min",
            FilterKey::Experience => "experience",
            FilterKey::Schedule => "schedule",
            FilterKey::Employment => "employment",
            FilterKey::Area => "area",
        }
    }

    pub fn parse(value: &str) -> Option<FilterKey> {
        Self::ALL.iter().copied().find(|key| key.as_str() == value)
    }
}

/// Per-user filter configuration: at most one value per key, last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    values: BTreeMap<FilterKey, String>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: FilterKey, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    pub fn get(&self, key: FilterKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    pub fn remove(&mut self, key: FilterKey) -> Option<String> {
        self.values.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FilterKey, &str)> {
        self.values.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Experience bands accepted by the search API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Experience {
    NoExperience,
    Between1And3,
    Between3And6,
    MoreThan6,
}

impl Experience {
    pub fn as_param(&self) -> &'static str {
        match self {
            Experience::NoExperience => "noExperience",
            Experience::Between1And3 => "between1And3",
            Experience::Between3And6 => "between3And6",
            Experience::MoreThan6 => "moreThan6",
        }
    }

    /// Stored filter values pass through an allow-list; anything else is
    /// dropped by the normalizer.
    pub fn from_stored(value: &str) -> Option<Experience> {
        match value {
            "noExperience" => Some(Experience::NoExperience),
            "between1And3" => Some(Experience::Between1And3),
            "between3And6" => Some(Experience::Between3And6),
            "moreThan6" => Some(Experience::MoreThan6),
            _ => None,
        }
    }
}

/// Work schedule values accepted by the search API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    FullDay,
    Remote,
    Flexible,
}

impl Schedule {
    pub fn as_param(&self) -> &'static str {
        match self {
            Schedule::FullDay => "fullDay",
            Schedule::Remote => "remote",
            Schedule::Flexible => "flexible",
        }
    }

    pub fn from_stored(value: &str) -> Option<Schedule> {
        match value {
            "office" => Some(Schedule::FullDay),
            "remote" => Some(Schedule::Remote),
            "hybrid" | "flexible" => Some(Schedule::Flexible),
            _ => None,
        }
    }
}

/// Employment type values accepted by the search API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Employment {
    Full,
    Part,
    Project,
    Probation,
}

impl Employment {
    pub fn as_param(&self) -> &'static str {
        match self {
            Employment::Full => "full",
            Employment::Part => "part",
            Employment::Project => "project",
            Employment::Probation => "probation",
        }
    }

    pub fn from_stored(value: &str) -> Option<Employment> {
        match value {
            "fullDay" => Some(Employment::Full),
            "partDay" => Some(Employment::Part),
            "project" => Some(Employment::Project),
            "internship" => Some(Employment::Probation),
            _ => None,
        }
    }
}

/// Result ordering forced onto background checks.
pub const ORDER_BY_PUBLICATION: &str = "publication_time";

/// Gateway-ready search parameters, derived deterministically from a
/// `FilterSet`. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub experience: Option<Experience>,
    pub salary: Option<u32>,
    pub only_with_salary: bool,
    pub schedule: Option<Schedule>,
    pub employment: Option<Employment>,
    pub area: Option<u32>,
    pub per_page: u8,
    pub page: u32,
    pub order_by: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            experience: None,
            salary: None,
            only_with_salary: false,
            schedule: None,
            employment: None,
            area: None,
            per_page: BACKGROUND_PAGE_SIZE,
            page: 0,
            order_by: None,
            date_from: None,
        }
    }
}

/// Salary range as reported by the search API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub currency: String,
}

/// One listing returned by the search API. The `id` is opaque and stable
/// across repeated queries for the same underlying posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacancyRecord {
    pub id: String,
    pub title: String,
    pub employer: Option<String>,
    pub area: Option<String>,
    pub experience: Option<String>,
    pub salary: Option<SalaryRange>,
    /// `None` when the API omitted the timestamp or sent one that does not
    /// parse; formatting degrades instead of failing.
    pub published_at: Option<DateTime<Utc>>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AreasFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    areas: BTreeMap<String, u32>,
}

/// City-name → numeric area id lookup. Ships with a seed table of major
/// cities; an `areas.yaml` file can extend or override it.
#[derive(Debug, Clone)]
pub struct AreaDirectory {
    by_name: BTreeMap<String, u32>,
}

impl Default for AreaDirectory {
    fn default() -> Self {
        let mut by_name = BTreeMap::new();
        for (name, id) in [
            ("москва", 1),
            ("санкт-петербург", 2),
            ("екатеринбург", 3),
            ("новосибирск", 4),
        ] {
            by_name.insert(name.to_string(), id);
        }
        Self { by_name }
    }
}

impl AreaDirectory {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: AreasFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut directory = Self::default();
        for (name, id) in file.areas {
            directory.by_name.insert(name.to_lowercase(), id);
        }
        Ok(directory)
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.get(&name.trim().to_lowercase()).copied()
    }
}

/// Converts a user's stored filters into gateway-ready parameters.
///
/// Pure with respect to its inputs: the same `FilterSet` (and `now`, for
/// background queries) always yields the same `SearchQuery`. Unrecognized
/// enum values and unparsable numbers are dropped, never raised.
#[derive(Debug, Clone, Default)]
pub struct FilterNormalizer {
    areas: AreaDirectory,
}

impl FilterNormalizer {
    pub fn new(areas: AreaDirectory) -> Self {
        Self { areas }
    }

    pub fn normalize(&self, filters: &FilterSet) -> SearchQuery {
        let mut query = SearchQuery::default();

        if let Some(profession) = filters.get(FilterKey::Profession) {
            let profession = profession.trim();
            if !profession.is_empty() {
                query.text = Some(profession.to_string());
            }
        }

        if let Some(raw) = filters.get(FilterKey::Experience) {
            query.experience = Experience::from_stored(raw.trim());
        }

        if let Some(raw) = filters.get(FilterKey::Schedule) {
            query.schedule = Schedule::from_stored(raw.trim());
        }

        if let Some(raw) = filters.get(FilterKey::Employment) {
            query.employment = Employment::from_stored(raw.trim());
        }

        if let Some(raw) = filters.get(FilterKey::SalaryMin) {
            match raw.trim().parse::<u32>() {
                Ok(salary) => {
                    query.salary = Some(salary);
                    query.only_with_salary = true;
                }
                Err(_) => warn!(value = raw, "dropping unparsable minimum salary filter"),
            }
        }

        if let Some(raw) = filters.get(FilterKey::Area) {
            let raw = raw.trim();
            if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
                match raw.parse::<u32>() {
                    Ok(id) => query.area = Some(id),
                    Err(_) => warn!(value = raw, "dropping out-of-range area id"),
                }
            } else if raw.eq_ignore_ascii_case(REMOTE_AREA_SENTINEL) {
                query.schedule = Some(Schedule::Remote);
            } else if let Some(id) = self.areas.lookup(raw) {
                query.area = Some(id);
            } else if !raw.is_empty() {
                // Unknown city: degrade to a free-text match on the name.
                warn!(city = raw, "area lookup miss, folding into text search");
                query.text = Some(match query.text.take() {
                    Some(text) => format!("{text} {raw}"),
                    None => raw.to_string(),
                });
            }
        }

        query
    }

    /// Normalize plus the fixed parameters every scheduler-driven check
    /// carries: most-recent-first ordering, a small page, and a trailing
    /// 24-hour window relative to `now`.
    pub fn background_query(&self, filters: &FilterSet, now: DateTime<Utc>) -> SearchQuery {
        let mut query = self.normalize(filters);
        query.order_by = Some(ORDER_BY_PUBLICATION.to_string());
        query.per_page = BACKGROUND_PAGE_SIZE;
        query.page = 0;
        query.date_from = Some(now - Duration::hours(BACKGROUND_WINDOW_HOURS));
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn filters(pairs: &[(FilterKey, &str)]) -> FilterSet {
        let mut set = FilterSet::new();
        for (key, value) in pairs {
            set.set(*key, *value);
        }
        set
    }

    #[test]
    fn last_write_wins_per_key() {
        let mut set = FilterSet::new();
        set.set(FilterKey::Profession, "разработчик");
        set.set(FilterKey::Profession, "аналитик");
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(FilterKey::Profession), Some("аналитик"));
    }

    #[test]
    fn filter_key_round_trips_through_storage_form() {
        for key in FilterKey::ALL {
            assert_eq!(FilterKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(FilterKey::parse("unknown"), None);
    }

    #[test]
    fn profession_becomes_text_verbatim() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[(FilterKey::Profession, "Rust разработчик")]));
        assert_eq!(query.text.as_deref(), Some("Rust разработчик"));
    }

    #[test]
    fn unrecognized_enum_values_are_dropped_silently() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[
            (FilterKey::Experience, "tenYears"),
            (FilterKey::Schedule, "nights"),
            (FilterKey::Employment, "freelance"),
        ]));
        assert_eq!(query.experience, None);
        assert_eq!(query.schedule, None);
        assert_eq!(query.employment, None);
    }

    #[test]
    fn schedule_and_employment_map_through_fixed_tables() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[
            (FilterKey::Schedule, "office"),
            (FilterKey::Employment, "internship"),
        ]));
        assert_eq!(query.schedule, Some(Schedule::FullDay));
        assert_eq!(query.employment, Some(Employment::Probation));

        let query = normalizer.normalize(&filters(&[(FilterKey::Schedule, "hybrid")]));
        assert_eq!(query.schedule, Some(Schedule::Flexible));
    }

    #[test]
    fn non_numeric_salary_is_dropped_without_aborting_other_fields() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[
            (FilterKey::SalaryMin, "сто тысяч"),
            (FilterKey::Profession, "тестировщик"),
        ]));
        assert_eq!(query.salary, None);
        assert!(!query.only_with_salary);
        assert_eq!(query.text.as_deref(), Some("тестировщик"));
    }

    #[test]
    fn numeric_salary_sets_only_with_salary() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[(FilterKey::SalaryMin, "100000")]));
        assert_eq!(query.salary, Some(100_000));
        assert!(query.only_with_salary);
    }

    #[test]
    fn digit_area_passes_through_as_id() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[(FilterKey::Area, "2")]));
        assert_eq!(query.area, Some(2));
    }

    #[test]
    fn remote_sentinel_sets_schedule_and_leaves_area_unset() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[(FilterKey::Area, "remote")]));
        assert_eq!(query.area, None);
        assert_eq!(query.schedule, Some(Schedule::Remote));
    }

    #[test]
    fn known_city_name_resolves_to_id() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[(FilterKey::Area, "Москва")]));
        assert_eq!(query.area, Some(1));
    }

    #[test]
    fn unknown_city_folds_into_text_search() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&filters(&[
            (FilterKey::Profession, "инженер"),
            (FilterKey::Area, "Урюпинск"),
        ]));
        assert_eq!(query.area, None);
        assert_eq!(query.text.as_deref(), Some("инженер Урюпинск"));
    }

    #[test]
    fn background_query_forces_ordering_window_and_page_size() {
        let normalizer = FilterNormalizer::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let query = normalizer.background_query(&filters(&[(FilterKey::Profession, "курьер")]), now);

        assert_eq!(query.order_by.as_deref(), Some(ORDER_BY_PUBLICATION));
        assert_eq!(query.per_page, BACKGROUND_PAGE_SIZE);
        assert_eq!(query.page, 0);
        assert_eq!(query.date_from, Some(now - Duration::hours(24)));
    }

    #[test]
    fn empty_filter_set_normalizes_to_default_query() {
        let normalizer = FilterNormalizer::default();
        let query = normalizer.normalize(&FilterSet::new());
        assert_eq!(query, SearchQuery::default());
    }
}
