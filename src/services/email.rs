use async_trait::async_trait;
use tracing::info;

use crate::services::providers::EmailSender;
use crate::utils::error::ProviderError;

/// Development email sender: logs the code instead of delivering it and
/// lets the send-code endpoint echo it back as `dev_code`. SMTP delivery
/// is a deployment concern behind the same trait.
pub struct DevEmailSender;

#[async_trait]
impl EmailSender for DevEmailSender {
    async fn send_verification_code(&self, to: &str, code: &str) -> Result<(), ProviderError> {
        info!(to, code, "DEV email: verification code (not delivered)");
        Ok(())
    }

    fn reveals_dev_code(&self) -> bool {
        true
    }
}
