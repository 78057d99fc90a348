use crate::errors::{AppError, AppResult};
use crate::models::UserProfile;
use sha2::Digest as _;
use std::fmt::Write as _;
use std::future::Future;

pub const MIN_PASSWORD_CHARS: usize = 6;

/// Identity boundary. The in-repo implementation lives on `LocalBackend`;
/// a hosted identity service would slot in behind the same trait.
pub trait IdentityProvider: Send + Sync {
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> impl Future<Output = AppResult<UserProfile>> + Send;
    fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = AppResult<UserProfile>> + Send;
    fn sign_out(&self) -> impl Future<Output = AppResult<()>> + Send;
}

/// Normalizes the email (trim, lowercase) and enforces the sign-up form
/// constraints. Returns the normalized email.
pub fn validate_credentials(email: &str, password: &str) -> AppResult<String> {
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::Auth("Invalid email address".to_string()));
    }
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AppError::Auth(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_CHARS
        )));
    }
    Ok(email)
}

// Stand-in credential digest for the local provider, not a hardened KDF.
pub fn digest_password(password: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}
