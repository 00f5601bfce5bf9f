use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub const EXPIRY_DAYS: i64 = 7;
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

/// 64 hex chars from two v4 uuids. Uuid v4 draws from the OS RNG, so the
/// token is unguessable.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn expiry_from(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::days(EXPIRY_DAYS)
}

pub fn signup_link(base_url: &str, token: &str) -> String {
    format!("{}/signup?token={}", base_url.trim_end_matches('/'), token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Viewer => "viewer",
        }
    }
}

/// Derived list-view state. Persisted state is only `used`; expiry is implicit
/// via the clock.
pub fn invitation_state(used: bool, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> &'static str {
    if used {
        "used"
    } else if expires_at <= now {
        "expired"
    } else {
        "pending"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_64_hex_chars_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn expiry_is_seven_days_out() {
        let created = Utc::now();
        assert_eq!(expiry_from(created) - created, Duration::days(7));
    }

    #[test]
    fn signup_link_handles_trailing_slash() {
        assert_eq!(
            signup_link("https://app.example.com/", "abc"),
            "https://app.example.com/signup?token=abc"
        );
        assert_eq!(
            signup_link(DEFAULT_BASE_URL, "abc"),
            "http://localhost:3000/signup?token=abc"
        );
    }

    #[test]
    fn state_prefers_used_over_expired() {
        let now = Utc::now();
        let past = now - Duration::days(1);
        let future = now + Duration::days(1);
        assert_eq!(invitation_state(true, past, now), "used");
        assert_eq!(invitation_state(false, past, now), "expired");
        assert_eq!(invitation_state(false, future, now), "pending");
    }

    #[test]
    fn role_parse_rejects_unknown() {
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("viewer"), Some(Role::Viewer));
        assert!(Role::parse("super_admin").is_none());
    }
}
