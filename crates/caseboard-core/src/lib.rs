use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub const REQUIRED_FIELD_MESSAGE: &str = "must not be empty";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CaseId(pub i64);

impl Display for CaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.parse::<i64>().map(Self)
    }
}

/// A persisted case record as returned by a [`RecordStore`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: CaseId,
    pub case_number: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_date_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified_date_time: OffsetDateTime,
}

/// Inbound create/update payload.
///
/// Every field is optional on the wire so that a missing or `null` value is
/// reported as a [`FieldViolation`] instead of a decoding failure. Server
/// assigned fields (`id`, timestamps) are not part of the payload and are
/// dropped during deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseInput {
    pub case_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
}

impl CaseInput {
    #[must_use]
    pub fn new(
        case_number: impl Into<String>,
        title: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            case_number: Some(case_number.into()),
            title: Some(title.into()),
            description: None,
            status: Some(status.into()),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Checks required fields and returns the validated field set.
    ///
    /// # Errors
    /// Returns [`CaseError::ValidationFailed`] with one violation per empty
    /// or missing required field, in `caseNumber`, `title`, `status` order.
    pub fn validate(&self) -> Result<CaseFields, CaseError> {
        let mut violations = Vec::new();
        let case_number =
            required_field("caseNumber", self.case_number.as_deref(), &mut violations);
        let title = required_field("title", self.title.as_deref(), &mut violations);
        let status = required_field("status", self.status.as_deref(), &mut violations);

        if !violations.is_empty() {
            return Err(CaseError::ValidationFailed(violations));
        }

        Ok(CaseFields {
            case_number,
            title,
            description: self.description.clone(),
            status,
        })
    }
}

fn required_field(
    field: &'static str,
    value: Option<&str>,
    violations: &mut Vec<FieldViolation>,
) -> String {
    match value {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            violations.push(FieldViolation::required(field));
            String::new()
        }
    }
}

/// Validated case fields handed to [`RecordStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseFields {
    pub case_number: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    #[must_use]
    pub fn required(field: &str) -> Self {
        Self {
            field: field.to_string(),
            message: REQUIRED_FIELD_MESSAGE.to_string(),
        }
    }
}

/// Identity and audit stamps assigned by the store on insert.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CreatedCase {
    pub id: CaseId,
    pub created_date_time: OffsetDateTime,
    pub last_modified_date_time: OffsetDateTime,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("unique constraint violated for case_number {case_number}")]
    UniqueViolation { case_number: String },
    #[error("case record {id} does not exist")]
    RecordMissing { id: CaseId },
    #[error("case store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UniqueViolation { .. } => "UniqueViolation",
            Self::RecordMissing { .. } => "RecordMissing",
            Self::Backend(_) => "StoreBackendError",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CaseError {
    #[error("validation failed for {} field(s)", .0.len())]
    ValidationFailed(Vec<FieldViolation>),
    #[error("Case <id: {id}> not found")]
    CaseNotFound { id: CaseId },
    #[error("Case number {case_number} cannot be reused")]
    DuplicateCaseNumber { case_number: String },
    #[error("Case operation failed")]
    StoreUnavailable(#[from] StoreError),
}

impl CaseError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "ValidationFailed",
            Self::CaseNotFound { .. } => "CaseNotFound",
            Self::DuplicateCaseNumber { .. } => "DuplicateCaseNumber",
            Self::StoreUnavailable(_) => "StoreUnavailable",
        }
    }
}

/// Durable keyed storage for cases.
///
/// Implementations own every consistency guarantee the service relies on:
/// `create` must check `case_number` uniqueness and insert atomically, and
/// `save` must only touch the mutable columns of an existing row.
pub trait RecordStore: Send + Sync {
    /// Inserts a new record and assigns its id and both timestamps.
    ///
    /// # Errors
    /// Returns [`StoreError::UniqueViolation`] when `case_number` is taken;
    /// nothing is written in that case.
    fn create(&self, fields: &CaseFields) -> Result<CreatedCase, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the lookup cannot be executed.
    fn find_by_id(&self, id: CaseId) -> Result<Option<Case>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the scan cannot be executed.
    fn find_all(&self) -> Result<Vec<Case>, StoreError>;

    /// Persists `title`, `description` and `status` of an existing record and
    /// refreshes `last_modified_date_time`. `id`, `case_number` and
    /// `created_date_time` keep their stored values.
    ///
    /// # Errors
    /// Returns [`StoreError::RecordMissing`] when no row has `case.id`.
    fn save(&self, case: &Case) -> Result<Case, StoreError>;

    /// Removes the record if present. Absent ids are a no-op.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the delete cannot be executed.
    fn delete_by_id(&self, id: CaseId) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct CaseService {
    store: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for CaseService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseService").finish_non_exhaustive()
    }
}

impl CaseService {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn from_store<S>(store: S) -> Self
    where
        S: RecordStore + 'static,
    {
        Self::new(Arc::new(store))
    }

    /// # Errors
    /// Returns [`CaseError::StoreUnavailable`] when the store scan fails.
    pub fn list_all(&self) -> Result<Vec<Case>, CaseError> {
        let cases = self.store.find_all()?;
        tracing::debug!(count = cases.len(), "listed cases");
        Ok(cases)
    }

    /// Absence is reported as `Ok(None)`; the caller decides how to surface it.
    ///
    /// # Errors
    /// Returns [`CaseError::StoreUnavailable`] when the lookup fails.
    pub fn get_by_id(&self, id: CaseId) -> Result<Option<Case>, CaseError> {
        Ok(self.store.find_by_id(id)?)
    }

    /// Validates and inserts a new case, returning the store-assigned id.
    ///
    /// # Errors
    /// - [`CaseError::ValidationFailed`] before any store call.
    /// - [`CaseError::DuplicateCaseNumber`] when the business key is taken.
    /// - [`CaseError::StoreUnavailable`] for any other store failure.
    pub fn insert(&self, candidate: &CaseInput) -> Result<CaseId, CaseError> {
        let fields = candidate.validate()?;

        match self.store.create(&fields) {
            Ok(created) => {
                tracing::debug!(
                    case_id = %created.id,
                    case_number = %fields.case_number,
                    "case inserted"
                );
                Ok(created.id)
            }
            Err(StoreError::UniqueViolation { case_number }) => {
                tracing::error!(%case_number, "case number already in use");
                Err(CaseError::DuplicateCaseNumber {
                    case_number: fields.case_number,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces `title`, `description` and `status` of an existing case.
    ///
    /// The candidate's `caseNumber` is validated but never written.
    ///
    /// # Errors
    /// - [`CaseError::ValidationFailed`] before any store call.
    /// - [`CaseError::CaseNotFound`] when `id` is absent, including when the
    ///   row disappears between lookup and save.
    /// - [`CaseError::StoreUnavailable`] for any other store failure.
    pub fn update(&self, id: CaseId, candidate: &CaseInput) -> Result<(), CaseError> {
        let fields = candidate.validate()?;

        let Some(mut existing) = self.store.find_by_id(id)? else {
            tracing::warn!(case_id = %id, "update target not found");
            return Err(CaseError::CaseNotFound { id });
        };

        existing.title = fields.title;
        existing.description = fields.description;
        existing.status = fields.status;

        match self.store.save(&existing) {
            Ok(saved) => {
                tracing::debug!(case_id = %saved.id, "case updated");
                Ok(())
            }
            Err(StoreError::RecordMissing { .. }) => {
                tracing::warn!(case_id = %id, "case removed before update was saved");
                Err(CaseError::CaseNotFound { id })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Idempotent: deleting an absent id succeeds.
    ///
    /// # Errors
    /// Returns [`CaseError::StoreUnavailable`] when the store delete fails.
    pub fn delete_by_id(&self, id: CaseId) -> Result<(), CaseError> {
        self.store.delete_by_id(id)?;
        tracing::debug!(case_id = %id, "case deleted");
        Ok(())
    }
}

/// `RwLock`-guarded map store for tests and `:memory:` style runs.
#[derive(Debug, Default)]
pub struct InMemoryCaseStore {
    state: RwLock<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    last_id: i64,
    records: BTreeMap<CaseId, Case>,
}

impl InMemoryCaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("in-memory case store lock poisoned".to_string())
    }
}

impl RecordStore for InMemoryCaseStore {
    fn create(&self, fields: &CaseFields) -> Result<CreatedCase, StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;

        if state
            .records
            .values()
            .any(|case| case.case_number == fields.case_number)
        {
            return Err(StoreError::UniqueViolation {
                case_number: fields.case_number.clone(),
            });
        }

        state.last_id += 1;
        let id = CaseId(state.last_id);
        let now = now_utc();
        state.records.insert(
            id,
            Case {
                id,
                case_number: fields.case_number.clone(),
                title: fields.title.clone(),
                description: fields.description.clone(),
                status: fields.status.clone(),
                created_date_time: now,
                last_modified_date_time: now,
            },
        );

        Ok(CreatedCase {
            id,
            created_date_time: now,
            last_modified_date_time: now,
        })
    }

    fn find_by_id(&self, id: CaseId) -> Result<Option<Case>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.records.get(&id).cloned())
    }

    fn find_all(&self) -> Result<Vec<Case>, StoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.records.values().cloned().collect())
    }

    fn save(&self, case: &Case) -> Result<Case, StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        let Some(stored) = state.records.get_mut(&case.id) else {
            return Err(StoreError::RecordMissing { id: case.id });
        };

        stored.title.clone_from(&case.title);
        stored.description.clone_from(&case.description);
        stored.status.clone_from(&case.status);
        stored.last_modified_date_time = now_utc();

        Ok(stored.clone())
    }

    fn delete_by_id(&self, id: CaseId) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        state.records.remove(&id);
        Ok(())
    }
}

/// Current UTC time truncated to microseconds, the precision stores keep.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc().to_offset(UtcOffset::UTC);
    now.replace_microsecond(now.microsecond()).unwrap_or(now)
}

/// # Errors
/// Returns the underlying formatting error when the value is out of range.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
}

/// Parses an RFC 3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns the underlying parse error for malformed input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
}
