use uuid::Uuid;

use crate::contracts::error::StorageError;
use crate::contracts::{Investigation, InvestigationOrder, OrderNumber, Patient, User};

/// Durable store for users, patients and investigations.
///
/// # Invariants
/// - Usernames are unique.
/// - `final_uhid` identifies at most one patient.
/// - An order number identifies at most one investigation.
/// - `record_investigation` is all-or-nothing: patient creation, unit linking
///   and the investigation itself commit together or not at all.
pub trait RecordStore: Send + Sync {
    /// Inserts a new user. Fails with `Conflict` if the username is taken.
    fn insert_user(&self, user: &User) -> Result<(), StorageError>;

    fn get_user(&self, id: Uuid) -> Result<Option<User>, StorageError>;

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    fn list_users(&self) -> Result<Vec<User>, StorageError>;

    /// Sets the default unit and department used when the user omits them.
    fn update_user_defaults(
        &self,
        id: Uuid,
        unit: &str,
        department: &str,
    ) -> Result<User, StorageError>;

    fn get_patient(&self, id: Uuid) -> Result<Option<Patient>, StorageError>;

    fn find_patient_by_uhid(&self, final_uhid: &str) -> Result<Option<Patient>, StorageError>;

    fn list_patients(&self) -> Result<Vec<Patient>, StorageError>;

    /// Finds or creates the patient, links the order's unit and department to
    /// them if missing, and stores the investigation under `order_no`.
    fn record_investigation(
        &self,
        order: &InvestigationOrder,
        order_no: OrderNumber,
        now_ms: i64,
    ) -> Result<Investigation, StorageError>;

    fn get_investigation(&self, order_no: OrderNumber)
        -> Result<Option<Investigation>, StorageError>;

    /// All investigations, ordered by order number.
    fn list_investigations(&self) -> Result<Vec<Investigation>, StorageError>;

    /// Investigations of one patient, ordered by order number.
    fn investigations_for_patient(
        &self,
        patient_id: Uuid,
    ) -> Result<Vec<Investigation>, StorageError>;

    /// Applies `update` to the investigation under a row lock and persists the
    /// result. Nothing is written if `update` returns an error.
    fn update_investigation<F, E>(
        &self,
        order_no: OrderNumber,
        update: F,
    ) -> Result<Investigation, E>
    where
        F: FnOnce(&mut Investigation) -> Result<(), E>,
        E: From<StorageError>;
}
