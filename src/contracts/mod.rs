pub mod error;
pub mod order_number;
pub mod records;
pub mod storage;

pub use error::{GenerationFailure, StorageError, TrackerError};
pub use order_number::{
    year_prefix, OrderNumber, OrderNumberGenerator, ParseOrderNumberError, SEQUENCE_WIDTH,
};
pub use records::{
    Gender, Investigation, InvestigationOrder, InvestigationStatus, Patient,
    PatientInvestigations, Role, UnitLink, User, UserView,
};
pub use storage::RecordStore;
