//! Investigation tracking workflows on top of the record store and the
//! order-number generator.
//!
//! Every operation takes the acting [`User`] and checks its role first.
//! Timestamps are passed in so callers (and tests) control the clock.

mod sessions;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contracts::{
    year_prefix, Gender, Investigation, InvestigationOrder, InvestigationStatus, OrderNumber,
    OrderNumberGenerator, Patient, PatientInvestigations, RecordStore, Role, TrackerError, User,
    UserView,
};

pub use sessions::Sessions;

/// Maximum number of patients returned by a search.
pub const SEARCH_LIMIT: usize = 10;

/// How far back the unit board looks for investigations.
pub const BOARD_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);

const CREATORS: &[Role] = &[Role::Doctor, Role::Pg, Role::Intern];
const CLINICAL_STAFF: &[Role] = &[Role::Doctor, Role::Pg, Role::Intern, Role::Nurse];
const PERFORMERS: &[Role] = &[Role::Pg, Role::Intern];
const ORDER_DESK: &[Role] = &[Role::Admin, Role::Nurse];

/// Workflow settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long after marking an investigation done it may be reversed.
    pub reversal_window: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reversal_window: Duration::from_secs(10 * 60),
        }
    }
}

impl TrackerConfig {
    /// Creates a config from environment variables.
    ///
    /// Reads:
    /// - `INVTRACK_REVERSAL_WINDOW_SECS`: Reversal window in seconds (default: 600)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            reversal_window: std::env::var("INVTRACK_REVERSAL_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.reversal_window),
        }
    }
}

/// A new investigation as requested by a clinician.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvestigation {
    pub uhid: String,
    pub suffix: Option<String>,
    /// Defaults to the two-digit current year.
    pub prefix: Option<String>,
    pub patient_name: String,
    pub patient_age: u32,
    pub patient_gender: Gender,
    /// Defaults to the requester's default unit.
    pub unit: Option<String>,
    /// Defaults to the requester's default department.
    pub department: Option<String>,
    pub investigation_type: String,
    #[serde(default)]
    pub special: bool,
}

/// Result of a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub user: UserView,
}

/// Checks that `actor` holds one of `allowed`.
fn require(actor: &User, allowed: &[Role], action: &str) -> Result<(), TrackerError> {
    if allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(TrackerError::Forbidden(format!(
            "{} users cannot {}",
            actor.role, action
        )))
    }
}

/// Returns the trimmed value, or `InvalidInput` if it is blank.
fn non_blank(value: &str, field: &str) -> Result<String, TrackerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(TrackerError::InvalidInput(format!("{} must not be empty", field)))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Returns the explicit value if present and non-blank, otherwise the fallback.
fn or_default(explicit: Option<String>, fallback: Option<&String>) -> Option<String> {
    explicit
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| fallback.cloned())
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// The investigation tracking service.
pub struct Tracker<S: RecordStore, G: OrderNumberGenerator> {
    store: Arc<S>,
    orders: Arc<G>,
    sessions: Sessions,
    config: TrackerConfig,
}

impl<S: RecordStore, G: OrderNumberGenerator> Tracker<S, G> {
    pub fn new(store: Arc<S>, orders: Arc<G>, config: TrackerConfig) -> Self {
        Self {
            store,
            orders,
            sessions: Sessions::new(),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn orders(&self) -> &G {
        &self.orders
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// Checks the password and opens a session.
    pub fn login(&self, username: &str, password: &str) -> Result<Session, TrackerError> {
        let user = self
            .store
            .find_user_by_username(username)?
            .filter(|u| u.password == password)
            .ok_or_else(|| TrackerError::Unauthorized("Invalid username or password".into()))?;

        let token = self.sessions.issue(user.id);
        tracing::info!(user_id = %user.id, role = %user.role, "User logged in");

        Ok(Session {
            token,
            user: user.view(),
        })
    }

    pub fn logout(&self, token: &str) {
        self.sessions.revoke(token);
    }

    /// Resolves a session token to its current user record.
    pub fn authenticate(&self, token: &str) -> Result<User, TrackerError> {
        let user_id = self
            .sessions
            .resolve(token)
            .ok_or_else(|| TrackerError::Unauthorized("Invalid or expired session".into()))?;

        match self.store.get_user(user_id)? {
            Some(user) => Ok(user),
            None => {
                self.sessions.revoke(token);
                Err(TrackerError::Unauthorized("User no longer exists".into()))
            }
        }
    }

    pub fn set_default_settings(
        &self,
        actor: &User,
        unit: &str,
        department: &str,
    ) -> Result<UserView, TrackerError> {
        let unit = non_blank(unit, "unit")?;
        let department = non_blank(department, "department")?;

        let user = self
            .store
            .update_user_defaults(actor.id, &unit, &department)?;
        Ok(user.view())
    }

    pub fn list_users(&self, actor: &User) -> Result<Vec<UserView>, TrackerError> {
        require(actor, &[Role::Admin], "list users")?;
        Ok(self.store.list_users()?.iter().map(User::view).collect())
    }

    /// Case-insensitive search on final UHID or name.
    ///
    /// Patients registered under the actor's default unit and department are
    /// searched first; if none match, all patients are searched. An empty
    /// keyword matches every patient.
    pub fn search_patients(
        &self,
        actor: &User,
        keyword: &str,
    ) -> Result<Vec<Patient>, TrackerError> {
        let keyword = keyword.trim().to_lowercase();
        let matching: Vec<Patient> = self
            .store
            .list_patients()?
            .into_iter()
            .filter(|p| {
                p.final_uhid.to_lowercase().contains(&keyword)
                    || p.name.to_lowercase().contains(&keyword)
            })
            .collect();

        if let (Some(unit), Some(department)) = (&actor.default_unit, &actor.default_department) {
            let local: Vec<Patient> = matching
                .iter()
                .filter(|p| p.is_linked_to(unit, department))
                .take(SEARCH_LIMIT)
                .cloned()
                .collect();
            if !local.is_empty() {
                return Ok(local);
            }
        }

        Ok(matching.into_iter().take(SEARCH_LIMIT).collect())
    }

    /// All investigations, or the one with `order_no`.
    pub fn investigations(
        &self,
        actor: &User,
        order_no: Option<OrderNumber>,
    ) -> Result<Vec<Investigation>, TrackerError> {
        require(actor, ORDER_DESK, "list investigations")?;

        match order_no {
            Some(order_no) => Ok(self.store.get_investigation(order_no)?.into_iter().collect()),
            None => Ok(self.store.list_investigations()?),
        }
    }

    pub fn special_investigations(&self, actor: &User) -> Result<Vec<Investigation>, TrackerError> {
        require(actor, CREATORS, "view special investigations")?;

        Ok(self
            .store
            .list_investigations()?
            .into_iter()
            .filter(|i| i.special)
            .collect())
    }

    pub fn investigations_for_patient(
        &self,
        actor: &User,
        patient_id: Uuid,
    ) -> Result<Vec<Investigation>, TrackerError> {
        require(actor, CLINICAL_STAFF, "view patient investigations")?;
        if self.store.get_patient(patient_id)?.is_none() {
            return Err(TrackerError::NotFound(format!("Patient {} not found", patient_id)));
        }
        Ok(self.store.investigations_for_patient(patient_id)?)
    }

    /// Patients of the actor's default unit and department, each with their
    /// investigations from the last 24 hours, newest first.
    pub fn unit_board(
        &self,
        actor: &User,
        status: Option<InvestigationStatus>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PatientInvestigations>, TrackerError> {
        require(actor, CLINICAL_STAFF, "view the unit board")?;

        let (Some(unit), Some(department)) = (&actor.default_unit, &actor.default_department)
        else {
            return Err(TrackerError::InvalidInput(
                "Set a default unit and department first".into(),
            ));
        };

        let since_ms = now.timestamp_millis() - millis(BOARD_LOOKBACK);
        let mut board = Vec::new();

        for patient in self.store.list_patients()? {
            if !patient.is_linked_to(unit, department) {
                continue;
            }

            let mut investigations: Vec<Investigation> = self
                .store
                .investigations_for_patient(patient.id)?
                .into_iter()
                .filter(|i| i.created_at_ms >= since_ms)
                .filter(|i| status.map_or(true, |s| i.status == s))
                .collect();
            investigations.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));

            board.push(PatientInvestigations {
                patient,
                investigations,
            });
        }

        board.sort_by(|a, b| a.patient.final_uhid.cmp(&b.patient.final_uhid));
        Ok(board)
    }

    /// Registers (or reuses) the patient and records a new investigation.
    ///
    /// The order number is allocated before anything else is written, so a
    /// failed allocation persists nothing. If recording fails afterwards the
    /// allocated number is skipped.
    ///
    /// The year in both the default UHID prefix and the order number is the
    /// calendar year of `now` in its own time zone.
    pub fn create_investigation<Tz: TimeZone>(
        &self,
        actor: &User,
        request: CreateInvestigation,
        now: DateTime<Tz>,
    ) -> Result<Investigation, TrackerError> {
        require(actor, CREATORS, "create investigations")?;
        if request.special && actor.role != Role::Doctor {
            return Err(TrackerError::Forbidden(
                "Only Doctors can create special investigations".into(),
            ));
        }

        let order = self.resolve_order(actor, request, year_prefix(now.clone()))?;
        let order_no = self.orders.next_order_number_at(now.clone())?;

        let investigation = self
            .store
            .record_investigation(&order, order_no, now.timestamp_millis())
            .inspect_err(|e| {
                tracing::warn!(
                    order_no = %order_no,
                    error = %e,
                    "Order number allocated but investigation not recorded"
                );
            })?;

        tracing::info!(
            order_no = %investigation.order_no,
            patient_id = %investigation.patient_id,
            created_by = %actor.id,
            special = investigation.special,
            "Investigation created"
        );

        Ok(investigation)
    }

    /// Applies defaults and validates a creation request.
    fn resolve_order(
        &self,
        actor: &User,
        request: CreateInvestigation,
        year: u8,
    ) -> Result<InvestigationOrder, TrackerError> {
        let unit = or_default(request.unit, actor.default_unit.as_ref()).ok_or_else(|| {
            TrackerError::InvalidInput("unit is required when no default unit is set".into())
        })?;
        let department = or_default(request.department, actor.default_department.as_ref())
            .ok_or_else(|| {
                TrackerError::InvalidInput(
                    "department is required when no default department is set".into(),
                )
            })?;
        let prefix = request
            .prefix
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| format!("{:02}", year));

        Ok(InvestigationOrder {
            prefix,
            uhid: non_blank(&request.uhid, "uhid")?,
            suffix: request
                .suffix
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            patient_name: non_blank(&request.patient_name, "patient_name")?,
            patient_age: request.patient_age,
            patient_gender: request.patient_gender,
            unit,
            department,
            investigation_type: non_blank(&request.investigation_type, "investigation_type")?,
            special: request.special,
            created_by: actor.id,
        })
    }

    /// Pending -> Done.
    pub fn mark_done(
        &self,
        actor: &User,
        order_no: OrderNumber,
        now: DateTime<Utc>,
    ) -> Result<Investigation, TrackerError> {
        require(actor, PERFORMERS, "mark investigations as done")?;
        let now_ms = now.timestamp_millis();

        let investigation = self.store.update_investigation(order_no, |inv| {
            if inv.status == InvestigationStatus::Done {
                return Err(TrackerError::InvalidTransition(format!(
                    "Investigation {} is already {}",
                    order_no, inv.status
                )));
            }
            inv.status = InvestigationStatus::Done;
            inv.done_by = Some(actor.id);
            inv.done_at_ms = Some(now_ms);
            inv.updated_at_ms = now_ms;
            Ok(())
        })?;

        tracing::info!(order_no = %order_no, done_by = %actor.id, "Investigation marked done");
        Ok(investigation)
    }

    /// Done -> Pending, only within the reversal window.
    pub fn reverse_done(
        &self,
        actor: &User,
        order_no: OrderNumber,
        now: DateTime<Utc>,
    ) -> Result<Investigation, TrackerError> {
        require(actor, PERFORMERS, "reverse investigations marked as done")?;
        let now_ms = now.timestamp_millis();
        let window = self.config.reversal_window;

        let investigation = self.store.update_investigation(order_no, |inv| {
            let done_at_ms = match (inv.status, inv.done_at_ms) {
                (InvestigationStatus::Done, Some(done_at_ms)) => done_at_ms,
                _ => {
                    return Err(TrackerError::InvalidTransition(format!(
                        "Investigation {} is {}, not {}",
                        order_no,
                        inv.status,
                        InvestigationStatus::Done
                    )))
                }
            };
            if now_ms - done_at_ms > millis(window) {
                return Err(TrackerError::ReversalWindowElapsed {
                    order_no: order_no.to_string(),
                    window_secs: window.as_secs(),
                });
            }
            inv.status = InvestigationStatus::Pending;
            inv.done_by = None;
            inv.done_at_ms = None;
            inv.updated_at_ms = now_ms;
            Ok(())
        })?;

        tracing::info!(
            order_no = %order_no,
            reversed_by = %actor.id,
            "Investigation reverted to pending"
        );
        Ok(investigation)
    }
}
