use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_EMAIL_LEN;

/// Shared-secret login. The user name presented at startup becomes the
/// session's identity, so it has to look like an email.
#[derive(Debug)]
pub struct HavenAuthSource {
    password: String,
}

impl HavenAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// Cheap shape check: one `@` with something on both sides.
pub fn is_plausible_email(user: &str) -> bool {
    if user.len() > MAX_EMAIL_LEN || user.chars().any(char::is_whitespace) {
        return false;
    }
    match user.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

#[async_trait]
impl AuthSource for HavenAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if !is_plausible_email(user) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("rejecting login for non-email user {user:?}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "login user must be an email address".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
