//! Agent-side authentication policy.
//!
//! The broker has already authenticated the remote client before bridging
//! it through the tunnel; the agent's own SSH auth exists to satisfy the
//! protocol rather than to gate access a second time. Without a configured
//! single-user password, any password is accepted; any offered public key
//! is accepted unconditionally.

#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    single_user_password: Option<String>,
}

impl Authenticator {
    pub fn new(single_user_password: Option<String>) -> Self {
        Self {
            single_user_password,
        }
    }

    pub fn check_password(&self, password: &str) -> bool {
        match &self.single_user_password {
            Some(expected) => expected == password,
            None => true,
        }
    }

    pub fn check_public_key(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_any_password_when_unconfigured() {
        let auth = Authenticator::new(None);
        assert!(auth.check_password("anything"));
        assert!(auth.check_password(""));
    }

    #[test]
    fn requires_exact_match_when_configured() {
        let auth = Authenticator::new(Some("secret".into()));
        assert!(auth.check_password("secret"));
        assert!(!auth.check_password("wrong"));
    }

    #[test]
    fn accepts_any_public_key_regardless_of_password_policy() {
        let auth = Authenticator::new(Some("secret".into()));
        assert!(auth.check_public_key());
    }
}
