//! Best-effort Redfish session sweep.
//!
//! BMCs with dirty shutdown history accumulate orphan sessions until they
//! refuse new ones. Around session start/stop we list
//! `/redfish/v1/Sessions` over HTTPS (self-signed certs, so verification
//! is off) and DELETE every member. Any failure is silently ignored — this
//! is a courtesy, not a dependency.

use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::constants::REDFISH_TIMEOUT;

#[derive(Debug, Deserialize)]
struct SessionCollection {
    #[serde(rename = "Members", default)]
    members: Vec<SessionRef>,
}

#[derive(Debug, Deserialize)]
struct SessionRef {
    #[serde(rename = "@odata.id")]
    odata_id: String,
}

/// Delete every Redfish session on `host`. Logs at debug only; callers
/// never learn whether it worked.
pub async fn sweep_sessions(host: &str, username: &str, password: &str) {
    if let Err(e) = try_sweep(host, username, password).await {
        debug!("[{host}] redfish sweep skipped: {e}");
    }
}

async fn try_sweep(host: &str, username: &str, password: &str) -> Result<(), reqwest::Error> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(REDFISH_TIMEOUT)
        .connect_timeout(Duration::from_secs(3))
        .build()?;

    let base = format!("https://{host}");
    let collection: SessionCollection = client
        .get(format!("{base}/redfish/v1/Sessions"))
        .basic_auth(username, Some(password))
        .send()
        .await?
        .json()
        .await?;

    for member in collection.members {
        let result = client
            .delete(format!("{base}{}", member.odata_id))
            .basic_auth(username, Some(password))
            .send()
            .await;
        match result {
            Ok(resp) => debug!(
                "[{host}] redfish session {} delete: {}",
                member.odata_id,
                resp.status()
            ),
            Err(e) => debug!("[{host}] redfish session {} delete failed: {e}", member.odata_id),
        }
    }
    Ok(())
}
