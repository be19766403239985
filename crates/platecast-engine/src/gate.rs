//! Shared-secret gate. The caller owns the [`Session`]; pipeline code never
//! looks at it.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("a password is required")]
    PasswordRequired,
    #[error("password does not match")]
    WrongPassword,
    #[error("session is locked")]
    Locked,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    expected: Option<String>,
    unlocked: bool,
}

impl Session {
    /// With no configured secret the session starts unlocked.
    pub fn new(expected: Option<String>) -> Self {
        let expected = expected
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let unlocked = expected.is_none();
        Self { expected, unlocked }
    }

    pub fn is_protected(&self) -> bool {
        self.expected.is_some()
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn unlock(&mut self, attempt: Option<&str>) -> Result<(), GateError> {
        let Some(expected) = &self.expected else {
            self.unlocked = true;
            return Ok(());
        };
        let attempt = attempt
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(GateError::PasswordRequired)?;
        if digest(attempt) == digest(expected) {
            self.unlocked = true;
            Ok(())
        } else {
            self.unlocked = false;
            Err(GateError::WrongPassword)
        }
    }

    pub fn require(&self) -> Result<(), GateError> {
        if self.unlocked {
            Ok(())
        } else {
            Err(GateError::Locked)
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("protected", &self.is_protected())
            .field("unlocked", &self.unlocked)
            .finish()
    }
}

// Fixed-length comparison input.
fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}
