//! Roles, password hashing and the in-memory session.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Diretor,
    Secretaria,
    Pedagogico,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Admin" => Some(Self::Admin),
            "Diretor" => Some(Self::Diretor),
            "Secretaria" => Some(Self::Secretaria),
            "Pedagogico" => Some(Self::Pedagogico),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::Diretor => "Diretor",
            Self::Secretaria => "Secretaria",
            Self::Pedagogico => "Pedagogico",
        }
    }

    /// Dashboard the UI lands on after login.
    pub fn home(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Diretor => "diretor",
            Self::Secretaria => "secretaria",
            Self::Pedagogico => "pedagogico",
        }
    }
}

pub const ADM: &[Role] = &[Role::Admin];
pub const DIR: &[Role] = &[Role::Admin, Role::Diretor];
pub const SEC: &[Role] = &[Role::Admin, Role::Diretor, Role::Secretaria];
pub const PED: &[Role] = &[Role::Admin, Role::Diretor, Role::Pedagogico];

pub const MIN_PASSWORD_LEN: usize = 8;

/// Minimal strength rule: long enough and not purely numeric.
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "password must have at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if password.chars().all(|c| c.is_ascii_digit()) {
        return Err("password cannot be entirely numeric".to_string());
    }
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("password hashing failed: {e}"))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub opened_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: String, username: String, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            username,
            role,
            opened_at: now,
            last_seen: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, idle_minutes: i64) -> bool {
        idle_minutes > 0 && now - self.last_seen > Duration::minutes(idle_minutes)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    pub fn has_any(&self, allowed: &[Role]) -> bool {
        allowed.contains(&self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_rules() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("12345678").is_err());
        assert!(validate_password("secret-123").is_ok());
    }

    #[test]
    fn hash_then_verify() {
        let h = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &h));
        assert!(!verify_password("wrong horse", &h));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn session_expires_after_idle_window() {
        let t0 = Utc::now();
        let mut s = Session::new("u".into(), "ana".into(), Role::Secretaria, t0);
        assert!(!s.is_expired(t0 + Duration::minutes(45), 45));
        assert!(s.is_expired(t0 + Duration::minutes(46), 45));
        s.touch(t0 + Duration::minutes(40));
        assert!(!s.is_expired(t0 + Duration::minutes(80), 45));
    }

    #[test]
    fn role_sets() {
        assert!(SEC.contains(&Role::Secretaria));
        assert!(!PED.contains(&Role::Secretaria));
        assert_eq!(Role::parse("Pedagogico").map(Role::home), Some("pedagogico"));
        assert!(Role::parse("admin").is_none());
    }
}
