use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Argon2 is deliberately slow; both operations run on a blocking worker
/// so the request-dispatch loop never stalls on hashing.
pub async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| anyhow!("Password hashing failed: {}", e))
    })
    .await?
}

pub async fn verify_password(password: &str, hashed: &str) -> Result<bool> {
    let password = password.to_string();
    let hashed = hashed.to_string();
    tokio::task::spawn_blocking(move || {
        let parsed =
            PasswordHash::new(&hashed).map_err(|e| anyhow!("Invalid password hash: {}", e))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await?
}

/// Password policy: at least 8 chars with both a letter and a digit.
pub fn validate_password_policy(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters".into());
    }
    if !password.chars().any(|c| c.is_alphabetic()) {
        return Err("Password must contain at least one letter".into());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one digit".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_and_verify() {
        let hashed = hash_password("Password1").await.unwrap();
        assert!(verify_password("Password1", &hashed).await.unwrap());
        assert!(!verify_password("Password2", &hashed).await.unwrap());
    }

    #[test]
    fn policy() {
        assert!(validate_password_policy("Password1").is_ok());
        assert!(validate_password_policy("short1").is_err());
        assert!(validate_password_policy("allletters").is_err());
        assert!(validate_password_policy("123456789").is_err());
    }
}
