use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    Direction, IteratorMode, Options, Transaction, TransactionDB, TransactionDBOptions,
    TransactionOptions, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::contracts::{
    Investigation, InvestigationOrder, InvestigationStatus, OrderNumber, Patient, RecordStore,
    StorageError, UnitLink, User,
};
use crate::storage::RocksDbOrderCounter;

/// Key prefix for user records
const USER_PREFIX: &str = "user";
/// Key prefix for the username uniqueness index
const USERNAME_PREFIX: &str = "username";
/// Key prefix for patient records
const PATIENT_PREFIX: &str = "patient";
/// Key prefix for the final UHID uniqueness index
const UHID_PREFIX: &str = "uhid";
/// Key prefix for investigations, keyed by order number
const INVESTIGATION_PREFIX: &str = "inv";
/// Key prefix for the patient -> investigation index
const PATIENT_INV_PREFIX: &str = "patient_inv";

/// Storage tuning read from the environment.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// How long a transaction waits for a row lock before failing.
    pub lock_timeout_ms: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1_000,
        }
    }
}

impl StorageConfig {
    /// Creates a config from environment variables.
    ///
    /// Reads:
    /// - `INVTRACK_LOCK_TIMEOUT_MS`: Row-lock wait in ms (default: 1000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            lock_timeout_ms: std::env::var("INVTRACK_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.lock_timeout_ms),
        }
    }
}

/// RocksDB-backed record store using pessimistic transactions.
///
/// Every read-modify-write goes through a [`Transaction`] that takes row locks
/// with `get_for_update`. Dropping a transaction without committing rolls it
/// back and releases its locks.
pub struct RocksDbStorage {
    db: Arc<TransactionDB>,
    config: StorageConfig,
}

impl RocksDbStorage {
    /// Opens or creates a storage at the given path with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_config(path, StorageConfig::default())
    }

    /// Opens or creates a storage at the given path.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: StorageConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.lock_timeout_ms);
        txn_db_opts.set_default_lock_timeout(config.lock_timeout_ms);

        let db = TransactionDB::open(&opts, &txn_db_opts, path.as_ref())?;

        tracing::debug!(
            path = %path.as_ref().display(),
            lock_timeout_ms = config.lock_timeout_ms,
            "Opened transactional store"
        );

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    /// Returns the order-number generator backed by this store's counter row.
    pub fn order_counter(&self) -> RocksDbOrderCounter {
        RocksDbOrderCounter::new(Arc::clone(&self.db), self.config.lock_timeout_ms)
    }

    /// Starts a transaction whose row locks time out after the configured wait.
    fn begin(&self) -> Transaction<'_, TransactionDB> {
        begin_transaction(&self.db, self.config.lock_timeout_ms)
    }

    fn user_key(id: Uuid) -> String {
        format!("{}:{}", USER_PREFIX, id)
    }

    fn username_key(username: &str) -> String {
        format!("{}:{}", USERNAME_PREFIX, username)
    }

    fn patient_key(id: Uuid) -> String {
        format!("{}:{}", PATIENT_PREFIX, id)
    }

    fn uhid_key(final_uhid: &str) -> String {
        format!("{}:{}", UHID_PREFIX, final_uhid)
    }

    fn investigation_key(order_no: OrderNumber) -> String {
        format!("{}:{}", INVESTIGATION_PREFIX, order_no)
    }

    fn patient_investigation_key(patient_id: Uuid, order_no: OrderNumber) -> String {
        format!("{}:{}:{}", PATIENT_INV_PREFIX, patient_id, order_no)
    }

    /// Reads and decodes a single record by key.
    fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolves an index entry holding a UUID to the record it points at.
    fn get_indexed<T: DeserializeOwned>(
        &self,
        index_key: &str,
        record_key: fn(Uuid) -> String,
    ) -> Result<Option<T>, StorageError> {
        match self.db.get(index_key.as_bytes())? {
            Some(id_bytes) => self.get_record(&record_key(parse_uuid(&id_bytes)?)),
            None => Ok(None),
        }
    }

    /// Collects the raw keys under `prefix:`.
    fn scan_keys(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        let prefix_bytes = format!("{}:", prefix).into_bytes();
        let mut keys = Vec::new();

        let iter = self
            .db
            .iterator(IteratorMode::From(&prefix_bytes, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix_bytes) {
                break;
            }
            keys.push(key.to_vec());
        }

        Ok(keys)
    }

    /// Decodes every record stored under `prefix:`.
    fn scan_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StorageError> {
        let prefix_bytes = format!("{}:", prefix).into_bytes();
        let mut records = Vec::new();

        let iter = self
            .db
            .iterator(IteratorMode::From(&prefix_bytes, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix_bytes) {
                break;
            }
            records.push(decode(&value)?);
        }

        Ok(records)
    }

    /// Loads the patient for `final_uhid` under row locks, if present.
    fn lock_patient_by_uhid(
        txn: &Transaction<'_, TransactionDB>,
        final_uhid: &str,
    ) -> Result<Option<Patient>, StorageError> {
        let Some(id_bytes) = txn.get_for_update(Self::uhid_key(final_uhid).as_bytes(), true)?
        else {
            return Ok(None);
        };

        let id = parse_uuid(&id_bytes)?;
        let bytes = txn
            .get_for_update(Self::patient_key(id).as_bytes(), true)?
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "Patient {} referenced by UHID {} is missing",
                    id, final_uhid
                ))
            })?;

        Ok(Some(decode(&bytes)?))
    }
}

/// Starts a pessimistic transaction with the given lock wait.
pub(crate) fn begin_transaction(
    db: &TransactionDB,
    lock_timeout_ms: i64,
) -> Transaction<'_, TransactionDB> {
    let mut txn_opts = TransactionOptions::default();
    txn_opts.set_lock_timeout(lock_timeout_ms);
    db.transaction_opt(&WriteOptions::default(), &txn_opts)
}

/// Serializes a record using bincode.
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Deserializes a record using bincode.
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_uuid(bytes: &[u8]) -> Result<Uuid, StorageError> {
    Uuid::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl RecordStore for RocksDbStorage {
    fn insert_user(&self, user: &User) -> Result<(), StorageError> {
        let txn = self.begin();
        let username_key = Self::username_key(&user.username);

        if txn.get_for_update(username_key.as_bytes(), true)?.is_some() {
            return Err(StorageError::Conflict(format!(
                "Username '{}' is already taken",
                user.username
            )));
        }

        txn.put(username_key.as_bytes(), user.id.as_bytes())?;
        txn.put(Self::user_key(user.id).as_bytes(), encode(user)?)?;
        txn.commit()?;

        Ok(())
    }

    fn get_user(&self, id: Uuid) -> Result<Option<User>, StorageError> {
        self.get_record(&Self::user_key(id))
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.get_indexed(&Self::username_key(username), Self::user_key)
    }

    fn list_users(&self) -> Result<Vec<User>, StorageError> {
        let mut users: Vec<User> = self.scan_records(USER_PREFIX)?;
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    fn update_user_defaults(
        &self,
        id: Uuid,
        unit: &str,
        department: &str,
    ) -> Result<User, StorageError> {
        let txn = self.begin();
        let key = Self::user_key(id);

        let bytes = txn
            .get_for_update(key.as_bytes(), true)?
            .ok_or_else(|| StorageError::NotFound(format!("User {}", id)))?;
        let mut user: User = decode(&bytes)?;

        user.default_unit = Some(unit.to_string());
        user.default_department = Some(department.to_string());

        txn.put(key.as_bytes(), encode(&user)?)?;
        txn.commit()?;

        Ok(user)
    }

    fn get_patient(&self, id: Uuid) -> Result<Option<Patient>, StorageError> {
        self.get_record(&Self::patient_key(id))
    }

    fn find_patient_by_uhid(&self, final_uhid: &str) -> Result<Option<Patient>, StorageError> {
        self.get_indexed(&Self::uhid_key(final_uhid), Self::patient_key)
    }

    fn list_patients(&self) -> Result<Vec<Patient>, StorageError> {
        self.scan_records(PATIENT_PREFIX)
    }

    fn record_investigation(
        &self,
        order: &InvestigationOrder,
        order_no: OrderNumber,
        now_ms: i64,
    ) -> Result<Investigation, StorageError> {
        let final_uhid = order.final_uhid();
        let txn = self.begin();

        let investigation_key = Self::investigation_key(order_no);
        if txn
            .get_for_update(investigation_key.as_bytes(), true)?
            .is_some()
        {
            return Err(StorageError::Conflict(format!(
                "Order number {} is already assigned",
                order_no
            )));
        }

        let (mut patient, mut patient_dirty) = match Self::lock_patient_by_uhid(&txn, &final_uhid)?
        {
            Some(existing) => (existing, false),
            None => {
                let patient = Patient {
                    id: Uuid::new_v4(),
                    prefix: order.prefix.clone(),
                    uhid: order.uhid.clone(),
                    suffix: order.suffix.clone(),
                    final_uhid: final_uhid.clone(),
                    name: order.patient_name.clone(),
                    age: order.patient_age,
                    gender: order.patient_gender,
                    units: Vec::new(),
                };
                txn.put(Self::uhid_key(&final_uhid).as_bytes(), patient.id.as_bytes())?;
                tracing::info!(
                    patient_id = %patient.id,
                    final_uhid = %final_uhid,
                    "Registering new patient"
                );
                (patient, true)
            }
        };

        if !patient.is_linked_to(&order.unit, &order.department) {
            if !patient.units.is_empty() {
                tracing::warn!(
                    final_uhid = %final_uhid,
                    unit = %order.unit,
                    department = %order.department,
                    "Patient exists but is not linked to this unit and department, adding link"
                );
            }
            patient.units.push(UnitLink {
                unit: order.unit.clone(),
                department: order.department.clone(),
            });
            patient_dirty = true;
        }

        if patient_dirty {
            txn.put(Self::patient_key(patient.id).as_bytes(), encode(&patient)?)?;
        }

        let investigation = Investigation {
            id: Uuid::new_v4(),
            order_no,
            patient_id: patient.id,
            final_uhid: patient.final_uhid.clone(),
            patient_name: patient.name.clone(),
            patient_age: patient.age,
            patient_gender: patient.gender,
            investigation_type: order.investigation_type.clone(),
            unit: order.unit.clone(),
            department: order.department.clone(),
            special: order.special,
            status: InvestigationStatus::Pending,
            created_by: order.created_by,
            done_by: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            done_at_ms: None,
        };

        txn.put(investigation_key.as_bytes(), encode(&investigation)?)?;
        txn.put(
            Self::patient_investigation_key(patient.id, order_no).as_bytes(),
            b"",
        )?;
        txn.commit()?;

        Ok(investigation)
    }

    fn get_investigation(
        &self,
        order_no: OrderNumber,
    ) -> Result<Option<Investigation>, StorageError> {
        self.get_record(&Self::investigation_key(order_no))
    }

    fn list_investigations(&self) -> Result<Vec<Investigation>, StorageError> {
        let mut investigations: Vec<Investigation> = self.scan_records(INVESTIGATION_PREFIX)?;
        investigations.sort_by_key(|i| i.order_no.sequence());
        Ok(investigations)
    }

    fn investigations_for_patient(
        &self,
        patient_id: Uuid,
    ) -> Result<Vec<Investigation>, StorageError> {
        let prefix = format!("{}:{}", PATIENT_INV_PREFIX, patient_id);
        let mut investigations = Vec::new();

        for key in self.scan_keys(&prefix)? {
            // Key format: patient_inv:{patient_id}:{order_no}
            let order_no = std::str::from_utf8(&key[prefix.len() + 1..])
                .ok()
                .and_then(|s| s.parse::<OrderNumber>().ok())
                .ok_or_else(|| {
                    StorageError::Serialization(format!(
                        "Malformed patient index key {}",
                        String::from_utf8_lossy(&key)
                    ))
                })?;

            if let Some(investigation) = self.get_investigation(order_no)? {
                investigations.push(investigation);
            }
        }

        investigations.sort_by_key(|i| i.order_no.sequence());
        Ok(investigations)
    }

    fn update_investigation<F, E>(
        &self,
        order_no: OrderNumber,
        update: F,
    ) -> Result<Investigation, E>
    where
        F: FnOnce(&mut Investigation) -> Result<(), E>,
        E: From<StorageError>,
    {
        let txn = self.begin();
        let key = Self::investigation_key(order_no);

        let bytes = txn
            .get_for_update(key.as_bytes(), true)
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::NotFound(format!("Investigation {}", order_no)))?;
        let mut investigation: Investigation = decode(&bytes)?;

        update(&mut investigation)?;

        txn.put(key.as_bytes(), encode(&investigation)?)
            .map_err(StorageError::from)?;
        txn.commit().map_err(StorageError::from)?;

        Ok(investigation)
    }
}
