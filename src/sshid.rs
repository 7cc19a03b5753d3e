//! Parsing of the `user@device` SSH login the external client types in.
//!
//! The broker reads this out of the inbound SSH username, so it has to cope
//! with whatever a user happens to type. Parsing never fails outright --
//! there is no well-formed/malformed distinction here, only "what device and
//! what user did they mean". A bare `device` with no `@` is just a device
//! with an empty user.

/// A parsed SSH login identifying the target device and the user to log in
/// as on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshId {
    pub user: String,
    pub device: String,
}

impl SshId {
    /// Parses `login` as `user@device` or, with no `@`, as a bare `device`
    /// (empty user).
    pub fn parse(login: &str) -> Self {
        match login.split_once('@') {
            Some((user, device)) => Self {
                user: user.to_string(),
                device: device.to_string(),
            },
            None => Self {
                user: String::new(),
                device: login.to_string(),
            },
        }
    }

    /// The device key used to look the tunnel up in the registry. Device ids
    /// without a namespace (no `:`) are implicitly in the `default`
    /// namespace, matching how agents register themselves when they were
    /// not given an explicit namespace.
    pub fn device_key(&self) -> String {
        if self.device.contains(':') {
            self.device.clone()
        } else {
            format!("default:{}", self.device)
        }
    }

    /// Whether `login` looked like a sensible `user@device`/`device` login
    /// rather than something the client probably didn't mean as one (a
    /// second `@`, an empty device component, embedded whitespace). This is
    /// advisory only -- [`Self::parse`] already produced a usable `SshId`
    /// either way, and a malformed-looking one is still dialed; it just
    /// gets logged as such first (spec's compatibility stance: never reject
    /// outright on this alone, since a device id component that turns out
    /// to be unresolvable fails the same way a missing device does).
    pub fn is_well_formed(login: &str) -> bool {
        let at_count = login.matches('@').count();
        if at_count > 1 {
            return false;
        }
        let device = login.split_once('@').map_or(login, |(_, device)| device);
        !device.is_empty() && !login.chars().any(char::is_whitespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_at_device() {
        let id = SshId::parse("root@my-device");
        assert_eq!(id.user, "root");
        assert_eq!(id.device, "my-device");
    }

    #[test]
    fn parses_bare_device_with_empty_user() {
        let id = SshId::parse("my-device");
        assert_eq!(id.user, "");
        assert_eq!(id.device, "my-device");
    }

    #[test]
    fn device_key_adds_default_namespace_when_missing() {
        assert_eq!(SshId::parse("my-device").device_key(), "default:my-device");
    }

    #[test]
    fn device_key_preserves_existing_namespace() {
        assert_eq!(
            SshId::parse("root@prod:my-device").device_key(),
            "prod:my-device"
        );
    }

    #[test]
    fn empty_login_never_panics() {
        let id = SshId::parse("");
        assert_eq!(id.device, "");
        assert_eq!(id.device_key(), "default:");
    }

    #[test]
    fn well_formed_logins_are_accepted() {
        assert!(SshId::is_well_formed("my-device"));
        assert!(SshId::is_well_formed("root@my-device"));
        assert!(SshId::is_well_formed("root@prod:my-device"));
    }

    #[test]
    fn a_second_at_sign_is_not_well_formed() {
        assert!(!SshId::is_well_formed("root@extra@my-device"));
    }

    #[test]
    fn an_empty_device_component_is_not_well_formed() {
        assert!(!SshId::is_well_formed("root@"));
    }

    #[test]
    fn embedded_whitespace_is_not_well_formed() {
        assert!(!SshId::is_well_formed("root@my device"));
    }

    #[test]
    fn parse_still_produces_an_sshid_for_malformed_logins() {
        // Parsing never fails outright -- only the first `@` is
        // significant, so this still yields a usable (if probably
        // unintended) device target rather than an error.
        let id = SshId::parse("root@extra@my-device");
        assert_eq!(id.user, "root");
        assert_eq!(id.device, "extra@my-device");
    }
}
