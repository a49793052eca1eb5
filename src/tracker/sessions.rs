use dashmap::DashMap;
use uuid::Uuid;

/// Opaque login sessions held in process memory.
///
/// Tokens are random and carry no user data; restarting the process logs
/// everybody out.
#[derive(Default)]
pub struct Sessions {
    tokens: DashMap<String, Uuid>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a new token for `user_id`.
    pub fn issue(&self, user_id: Uuid) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.insert(token.clone(), user_id);
        token
    }

    pub fn resolve(&self, token: &str) -> Option<Uuid> {
        self.tokens.get(token).map(|entry| *entry.value())
    }

    /// Returns true if the token existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_resolve_until_revoked() {
        let sessions = Sessions::new();
        let user = Uuid::new_v4();

        let token = sessions.issue(user);
        assert_eq!(sessions.resolve(&token), Some(user));

        assert!(sessions.revoke(&token));
        assert_eq!(sessions.resolve(&token), None);
        assert!(!sessions.revoke(&token));
    }

    #[test]
    fn each_login_gets_a_distinct_token() {
        let sessions = Sessions::new();
        let user = Uuid::new_v4();

        let a = sessions.issue(user);
        let b = sessions.issue(user);

        assert_ne!(a, b);
        assert_eq!(sessions.len(), 2);
    }
}
