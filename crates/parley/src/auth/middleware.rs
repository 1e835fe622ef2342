//! Authentication middleware and extractors.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, header::COOKIE, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};

use super::{AuthConfig, AuthError, Claims, DevUser, Principal, Role};

const TOKEN_ISSUER: &str = "parley";
const TOKEN_TTL_SECS: i64 = 3600 * 24;

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == cookie_name).then(|| value.trim())
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != "token" {
            return None;
        }
        urlencoding::decode(value).ok().map(|s| s.into_owned())
    })
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create auth state from config, resolving `env:VAR_NAME` secrets.
    pub fn new(mut config: AuthConfig) -> Self {
        if let Ok(Some(resolved)) = config.resolve_jwt_secret() {
            config.jwt_secret = Some(resolved);
        }

        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
        }
    }

    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    pub fn dev_users(&self) -> &[DevUser] {
        &self.config.dev_users
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if self.config.dev_mode {
            if let Some(user_id) = token.strip_prefix("dev:") {
                return self.dev_user_claims(user_id);
            }
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Validate a token and resolve the principal it acts as.
    pub fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        self.validate_token(token)
            .map(|claims| Principal::from_claims(&claims))
    }

    fn dev_user_claims(&self, user_id: &str) -> Result<Claims, AuthError> {
        let user = self
            .config
            .dev_users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or(AuthError::UserNotFound)?;

        let now = Utc::now().timestamp();
        Ok(Claims {
            sub: user.id.clone(),
            iss: Some("dev".to_string()),
            exp: now + TOKEN_TTL_SECS,
            iat: Some(now),
            email: Some(user.email.clone()),
            name: Some(user.name.clone()),
            roles: vec![user.role.to_string()],
            role: Some(user.role.to_string()),
        })
    }

    /// Sign a JWT for a user.
    pub fn generate_token(&self, user_id: &str, name: &str, role: Role) -> Result<String, AuthError> {
        let secret = self
            .config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: Some(TOKEN_ISSUER.to_string()),
            exp: now + TOKEN_TTL_SECS,
            iat: Some(now),
            email: None,
            name: Some(name.to_string()),
            roles: vec![role.to_string()],
            role: Some(role.to_string()),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub claims: Claims,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.claims.sub
    }

    pub fn is_admin(&self) -> bool {
        self.claims.is_admin()
    }

    pub fn display_name(&self) -> &str {
        self.claims.display_name()
    }

    pub fn principal(&self) -> Principal {
        Principal::from_claims(&self.claims)
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates the token and injects `CurrentUser` into request extensions.
/// Token sources in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
/// 3. token query parameter (browsers cannot set headers on WebSocket upgrades)
/// 4. X-Dev-User header (dev mode only)
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let headers = req.headers();
    let auth_header = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok());
    let cookie_token = headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie| token_from_cookie_header(cookie, "auth_token"));
    let query_token = req.uri().query().and_then(token_from_query);
    let dev_user = headers.get("X-Dev-User").and_then(|h| h.to_str().ok());

    let claims = if let Some(header) = auth_header {
        auth.validate_token(bearer_token_from_header(header)?)?
    } else if let Some(token) = cookie_token {
        auth.validate_token(token)?
    } else if let Some(ref token) = query_token {
        auth.validate_token(token)?
    } else if let (true, Some(user_id)) = (auth.is_dev_mode(), dev_user) {
        debug!("Using dev user: {}", user_id);
        auth.validate_token(&format!("dev:{}", user_id))?
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    req.extensions_mut().insert(CurrentUser { claims });
    Ok(next.run(req).await)
}

/// Require admin role.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub CurrentUser);

impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(AuthError::InsufficientPermissions(
                "admin role required".to_string(),
            ));
        }
        Ok(RequireAdmin(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn state(dev_mode: bool) -> AuthState {
        AuthState::new(AuthConfig {
            dev_mode,
            jwt_secret: Some(SECRET.to_string()),
            dev_users: vec![DevUser {
                id: "usr_dev".to_string(),
                name: "Dev".to_string(),
                email: "dev@example.com".to_string(),
                role: Role::Admin,
            }],
            allowed_origins: vec![],
        })
    }

    #[test]
    fn test_bearer_token_from_header() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(bearer_token_from_header("bearer   t1").unwrap(), "t1");
        for case in ["", "Bearer", "Token x", "Bearer a b"] {
            assert!(bearer_token_from_header(case).is_err(), "{case} should fail");
        }
    }

    #[test]
    fn test_cookie_and_query_tokens() {
        assert_eq!(
            token_from_cookie_header("theme=dark; auth_token=abc", "auth_token"),
            Some("abc")
        );
        assert_eq!(token_from_cookie_header("theme=dark", "auth_token"), None);
        assert_eq!(
            token_from_query("a=1&token=dev%3Ausr_1"),
            Some("dev:usr_1".to_string())
        );
    }

    #[test]
    fn test_generated_token_round_trips_to_principal() {
        let auth = state(false);
        let token = auth.generate_token("usr_1", "Alice", Role::User).unwrap();
        let principal = auth.authenticate(&token).unwrap();
        assert_eq!(principal, Principal::new("usr_1", false));

        let admin = auth.generate_token("usr_2", "Root", Role::Admin).unwrap();
        assert!(auth.authenticate(&admin).unwrap().elevated);
    }

    #[test]
    fn test_dev_tokens_only_in_dev_mode() {
        let dev = state(true);
        let principal = dev.authenticate("dev:usr_dev").unwrap();
        assert!(principal.elevated);
        assert!(matches!(
            dev.authenticate("dev:nobody"),
            Err(AuthError::UserNotFound)
        ));

        let prod = state(false);
        assert!(matches!(
            prod.authenticate("dev:usr_dev"),
            Err(AuthError::InvalidToken(_))
        ));
    }
}
