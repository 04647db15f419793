//! Provider credential refresh
//!
//! Long experiments outlive assumed-role sessions, so both rejuvenation
//! loops refresh credentials before each tick's mutating operations. The
//! production refresher shells out to `aws sts assume-role` and rewrites the
//! managed profile block in the shared credentials file; the SDK's default
//! chain picks the fresh keys up on its next credential load.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// Credential refresh seam
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Refresh provider credentials; called before each tick's mutations
    async fn refresh(&self) -> Result<()>;
}

/// No-op refresher for static credentials and tests
#[derive(Debug, Default)]
pub struct NoopRefresher;

#[async_trait]
impl CredentialRefresher for NoopRefresher {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Refresher that assumes an IAM role via the AWS CLI and rewrites the
/// managed profile in the shared credentials file
#[derive(Debug, Clone)]
pub struct AssumeRoleRefresher {
    /// Role to assume
    pub role_arn: String,

    /// Session name passed to STS
    pub session_name: String,

    /// Profile block this refresher owns in the credentials file
    pub profile: String,

    /// Path to the shared credentials file
    pub credentials_path: PathBuf,
}

impl AssumeRoleRefresher {
    /// Refresher writing to the conventional `~/.aws/credentials`
    pub fn new(role_arn: impl Into<String>, session_name: impl Into<String>, profile: impl Into<String>) -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Self {
            role_arn: role_arn.into(),
            session_name: session_name.into(),
            profile: profile.into(),
            credentials_path: PathBuf::from(home).join(".aws/credentials"),
        }
    }

    /// Rewrite the managed profile block, leaving everything above it alone
    fn rewrite_profile(&self, key_id: &str, secret: &str, token: &str) -> Result<()> {
        let header = format!("[{}]", self.profile);
        let existing = std::fs::read_to_string(&self.credentials_path).unwrap_or_default();
        let preserved: String = existing
            .lines()
            .take_while(|line| line.trim() != header)
            .map(|line| format!("{line}\n"))
            .collect();

        let mut contents = preserved;
        contents.push_str(&header);
        contents.push('\n');
        contents.push_str(&format!("aws_access_key_id = {key_id}\n"));
        contents.push_str(&format!("aws_secret_access_key = {secret}\n"));
        contents.push_str(&format!("aws_session_token = {token}\n"));

        if let Some(parent) = self.credentials_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.credentials_path, contents)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialRefresher for AssumeRoleRefresher {
    async fn refresh(&self) -> Result<()> {
        debug!(role_arn = %self.role_arn, "assuming role");

        let output = Command::new("aws")
            .args([
                "sts",
                "assume-role",
                "--role-arn",
                &self.role_arn,
                "--role-session-name",
                &self.session_name,
                "--output",
                "json",
            ])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProxyError::config(format!(
                "assume-role failed: {stderr}"
            )));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let creds = parsed
            .get("Credentials")
            .ok_or_else(|| ProxyError::config("assume-role response missing Credentials"))?;
        let field = |name: &str| -> Result<&str> {
            creds
                .get(name)
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProxyError::config(format!("assume-role response missing {name}")))
        };

        self.rewrite_profile(
            field("AccessKeyId")?,
            field("SecretAccessKey")?,
            field("SessionToken")?,
        )?;

        info!(profile = %self.profile, "credentials refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_preserves_lines_above_managed_profile() {
        let dir = std::env::temp_dir().join(format!("spotproxy-credtest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("credentials");
        std::fs::write(
            &path,
            "[default]\naws_access_key_id = AKIADEFAULT\naws_secret_access_key = abc\n[managed-role]\naws_access_key_id = OLD\n",
        )
        .unwrap();

        let refresher = AssumeRoleRefresher {
            role_arn: "arn:aws:iam::000000000000:role/example".to_string(),
            session_name: "test".to_string(),
            profile: "managed-role".to_string(),
            credentials_path: path.clone(),
        };
        refresher.rewrite_profile("NEWKEY", "NEWSECRET", "NEWTOKEN").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("[default]\naws_access_key_id = AKIADEFAULT"));
        assert!(contents.contains("[managed-role]\naws_access_key_id = NEWKEY"));
        assert!(!contents.contains("OLD"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_noop_refresher() {
        assert!(NoopRefresher.refresh().await.is_ok());
    }
}
