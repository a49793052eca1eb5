//! Default staff accounts for a fresh deployment.

use crate::contracts::{RecordStore, Role, StorageError, User};

/// The staff accounts created by `INVTRACK_SEED_USERS`.
pub fn default_staff() -> Vec<User> {
    [
        ("admin", "admin@example.com", "admin123", Role::Admin),
        ("doctor", "doctor@example.com", "doctor123", Role::Doctor),
        ("PG", "pg@example.com", "doctor123", Role::Pg),
        ("intern", "intern@example.com", "doctor123", Role::Intern),
        ("intern1", "intern1@example.com", "doctor123", Role::Intern),
        ("intern2", "intern2@example.com", "doctor123", Role::Intern),
        ("nurse", "nurse@example.com", "nurse123", Role::Nurse),
    ]
    .into_iter()
    .map(|(username, email, password, role)| User::new(username, email, password, role))
    .collect()
}

/// Inserts `users`, skipping usernames that already exist.
/// Returns how many were created.
pub fn seed_users<S: RecordStore>(store: &S, users: &[User]) -> Result<usize, StorageError> {
    let mut created = 0;

    for user in users {
        match store.insert_user(user) {
            Ok(()) => created += 1,
            Err(StorageError::Conflict(_)) => {
                tracing::debug!(username = %user.username, "User already exists, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(created)
}
