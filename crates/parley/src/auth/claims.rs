//! JWT claims and user roles.

use serde::{Deserialize, Serialize};

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular user, scoped to the accounts they belong to.
    #[default]
    User,
    /// Administrator with elevated privileges across tenants.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    /// User's email.
    #[serde(default)]
    pub email: Option<String>,

    /// User's name.
    #[serde(default)]
    pub name: Option<String>,

    /// User's roles.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Custom role claim (alternative to roles array).
    #[serde(default)]
    pub role: Option<String>,
}

impl Claims {
    /// Get the effective role for the user.
    pub fn effective_role(&self) -> Role {
        let named_admin = |role: &str| role.eq_ignore_ascii_case("admin");

        if self.role.as_deref().is_some_and(named_admin) {
            return Role::Admin;
        }
        if self.roles.iter().any(|r| named_admin(r)) {
            return Role::Admin;
        }
        Role::User
    }

    /// Check if the user has admin role.
    pub fn is_admin(&self) -> bool {
        self.effective_role() == Role::Admin
    }

    /// Get the display name for the user.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(sub: &str) -> Claims {
        Claims {
            sub: sub.to_string(),
            iss: None,
            exp: 0,
            iat: None,
            email: None,
            name: None,
            roles: vec![],
            role: None,
        }
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_claims_effective_role() {
        let plain = claims("usr_1");
        assert_eq!(plain.effective_role(), Role::User);

        let admin = Claims {
            role: Some("ADMIN".to_string()),
            ..plain.clone()
        };
        assert!(admin.is_admin());

        let admin_from_roles = Claims {
            roles: vec!["user".to_string(), "admin".to_string()],
            ..plain
        };
        assert_eq!(admin_from_roles.effective_role(), Role::Admin);
    }

    #[test]
    fn test_claims_display_name_falls_back_to_sub() {
        let c = Claims {
            email: Some("a@example.com".to_string()),
            ..claims("usr_2")
        };
        assert_eq!(c.display_name(), "a@example.com");
        assert_eq!(claims("usr_3").display_name(), "usr_3");
    }
}
