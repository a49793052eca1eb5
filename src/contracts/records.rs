use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contracts::OrderNumber;

/// Staff role. Authorization checks are expressed against this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Doctor,
    #[serde(rename = "PG")]
    Pg,
    Intern,
    Nurse,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Doctor => "Doctor",
            Role::Pg => "PG",
            Role::Intern => "Intern",
            Role::Nurse => "Nurse",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvestigationStatus {
    Pending,
    Done,
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationStatus::Pending => "Pending",
            InvestigationStatus::Done => "Done",
        }
    }
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvestigationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(InvestigationStatus::Pending),
            "Done" => Ok(InvestigationStatus::Done),
            other => Err(format!("Unknown status '{}'. Valid: Pending, Done", other)),
        }
    }
}

/// A staff account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// Never serialized into API responses; see [`UserView`].
    pub password: String,
    pub role: Role,
    pub default_unit: Option<String>,
    pub default_department: Option<String>,
}

impl User {
    pub fn new(username: &str, email: &str, password: &str, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            role,
            default_unit: None,
            default_department: None,
        }
    }

    pub fn view(&self) -> UserView {
        UserView {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role,
            default_unit: self.default_unit.clone(),
            default_department: self.default_department.clone(),
        }
    }
}

/// A user without credentials, safe to return to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub default_unit: Option<String>,
    pub default_department: Option<String>,
}

/// A (unit, department) pair a patient is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitLink {
    pub unit: String,
    pub department: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub prefix: String,
    pub uhid: String,
    pub suffix: Option<String>,
    /// `prefix ++ uhid ++ suffix`, unique across patients.
    pub final_uhid: String,
    pub name: String,
    pub age: u32,
    pub gender: Gender,
    pub units: Vec<UnitLink>,
}

impl Patient {
    pub fn final_uhid(prefix: &str, uhid: &str, suffix: Option<&str>) -> String {
        format!("{}{}{}", prefix, uhid, suffix.unwrap_or(""))
    }

    pub fn is_linked_to(&self, unit: &str, department: &str) -> bool {
        self.units
            .iter()
            .any(|u| u.unit == unit && u.department == department)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investigation {
    pub id: Uuid,
    pub order_no: OrderNumber,
    pub patient_id: Uuid,
    pub final_uhid: String,
    pub patient_name: String,
    pub patient_age: u32,
    pub patient_gender: Gender,
    pub investigation_type: String,
    pub unit: String,
    pub department: String,
    pub special: bool,
    pub status: InvestigationStatus,
    pub created_by: Uuid,
    pub done_by: Option<Uuid>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub done_at_ms: Option<i64>,
}

/// Everything needed to record an investigation except its order number.
///
/// Patient fields are only used when no patient with the same final UHID
/// exists yet.
#[derive(Debug, Clone)]
pub struct InvestigationOrder {
    pub prefix: String,
    pub uhid: String,
    pub suffix: Option<String>,
    pub patient_name: String,
    pub patient_age: u32,
    pub patient_gender: Gender,
    pub unit: String,
    pub department: String,
    pub investigation_type: String,
    pub special: bool,
    pub created_by: Uuid,
}

impl InvestigationOrder {
    pub fn final_uhid(&self) -> String {
        Patient::final_uhid(&self.prefix, &self.uhid, self.suffix.as_deref())
    }
}

/// A patient together with a filtered view of their investigations.
#[derive(Debug, Clone, Serialize)]
pub struct PatientInvestigations {
    pub patient: Patient,
    pub investigations: Vec<Investigation>,
}
