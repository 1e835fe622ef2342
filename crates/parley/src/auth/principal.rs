//! The identity a connection or request acts as.

use serde::Serialize;

use super::Claims;

/// Authenticated identity, fixed at handshake time.
///
/// Tenant membership is deliberately not part of the principal; it is looked
/// up on every authorization check because it can change while a connection
/// is open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub elevated: bool,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, elevated: bool) -> Self {
        Self {
            user_id: user_id.into(),
            elevated,
        }
    }

    pub fn from_claims(claims: &Claims) -> Self {
        Self::new(claims.sub.clone(), claims.is_admin())
    }

    pub fn has_elevated_privilege(&self) -> bool {
        self.elevated
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.elevated {
            write!(f, "{} (admin)", self.user_id)
        } else {
            f.write_str(&self.user_id)
        }
    }
}
