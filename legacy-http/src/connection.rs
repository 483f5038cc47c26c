use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::Client;

/// Response to a connect request.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ConnectResponse {
    /// Token to send with later requests. Present when the machine issued a
    /// new one, for example after the user approved the connection on the
    /// touch screen.
    #[serde(default)]
    pub token: Option<String>,
}

impl Client {
    /// Open a session. If the machine hands out a fresh token, it replaces
    /// the one this client was created with.
    pub async fn connect(&mut self) -> Result<ConnectResponse> {
        let resp: ConnectResponse = self.post_form("connect", &[]).await?.json().await?;
        if let Some(token) = &resp.token {
            tracing::debug!("machine issued a new session token");
            self.token = token.clone();
        }
        Ok(resp)
    }

    /// Close the session.
    pub async fn disconnect(&self) -> Result<()> {
        self.post_form("disconnect", &[]).await?;
        Ok(())
    }
}
