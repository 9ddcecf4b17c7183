use campus_common::{AccountInfo, UserRole};
use url::Url;

use crate::error::Result;

/// Signed-in user as the call core needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallUser {
    pub id: String,
    pub name: String,
    pub role: UserRole,
}

impl From<&AccountInfo> for CallUser {
    fn from(account: &AccountInfo) -> Self {
        Self {
            id: account.id.clone(),
            name: account.display_name.clone(),
            role: account.role,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub gateway_url: Url,
    pub session_token: Option<String>,
    pub user: Option<CallUser>,
}

impl ClientConfig {
    /// Request paths resolve beneath the URL's path, so a base without a
    /// trailing slash gets one.
    pub fn new(gateway_url: &str) -> Result<Self> {
        let mut gateway_url = Url::parse(gateway_url)?;
        if !gateway_url.path().ends_with('/') {
            let path = format!("{}/", gateway_url.path());
            gateway_url.set_path(&path);
        }
        Ok(Self {
            gateway_url,
            session_token: None,
            user: None,
        })
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}
