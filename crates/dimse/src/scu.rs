//! Service Class User (SCU) for outbound DIMSE operations
//!
//! C-ECHO lives here. C-FIND, C-MOVE and C-STORE are implemented on
//! [`DimseScu`] in their own modules (`find`, `retrieve`, `store`).

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::association::{Association, ContextProposal};
use crate::config::{DicomNode, DimseConfig};
use crate::message::echo_rq;
use crate::{DimseError, Result};

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct DimseScu {
    pub(crate) config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    /// Node used as calling AE and default move destination
    pub fn local_node(&self) -> &DicomNode {
        &self.config.local
    }

    /// Send a C-ECHO request and return the response status
    pub async fn echo(&self, node: &DicomNode) -> Result<u16> {
        node.require_network_info()?;
        info!("Sending C-ECHO to {}", node);

        let local = self.config.local.clone();
        let remote = node.clone();
        let config = self.config.clone();
        let status = tokio::task::spawn_blocking(move || echo_blocking(&local, &remote, &config))
            .await
            .map_err(|e| DimseError::internal(format!("C-ECHO task failed: {}", e)))??;

        info!(status = %format!("{:#06X}", status), "C-ECHO completed");
        Ok(status)
    }

    /// Test connectivity to a remote node with retry logic
    pub async fn test_connection(&self, node: &DicomNode, max_retries: u32) -> Result<bool> {
        let mut retries = 0;

        while retries <= max_retries {
            if retries > 0 {
                info!("Connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries.min(6))).await; // Exponential backoff
            }

            match self.echo(node).await {
                Ok(status) if status == crate::types::status::SUCCESS => {
                    info!("Connection test successful");
                    return Ok(true);
                }
                Ok(status) => {
                    warn!("C-ECHO answered with status {:#06X}", status);
                    return Ok(false);
                }
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("Connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                    continue;
                }
                Err(e) => {
                    error!("Connection test failed permanently: {}", e);
                    return Err(e);
                }
            }
        }

        Err(DimseError::operation_failed("Connection test failed after all retries"))
    }
}

fn echo_blocking(local: &DicomNode, remote: &DicomNode, config: &DimseConfig) -> Result<u16> {
    let mut association = Association::open(local, remote, &[ContextProposal::verification()], config)?;
    let pc = association.require_context(dicom_dictionary_std::uids::VERIFICATION)?;
    let message_id = association.next_message_id();
    association.send_message(pc.id, &echo_rq(message_id), None)?;

    let response = association.receive_message()?;
    let status = response
        .status()
        .ok_or_else(|| DimseError::operation_failed("C-ECHO response without status"))?;
    debug!(peer = association.peer(), "C-ECHO response received");

    if let Err(e) = association.release() {
        debug!("Release after C-ECHO failed: {}", e);
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_requires_network_info() {
        let scu = DimseScu::new(DimseConfig::default());
        let node = DicomNode::new("NO_ADDRESS");

        let result = scu.echo(&node).await;
        assert!(matches!(result, Err(DimseError::Config(_))));
    }

    #[tokio::test]
    async fn test_connection_gives_up_on_config_errors() {
        let scu = DimseScu::new(DimseConfig::default());
        let result = scu.test_connection(&DicomNode::new("NO_ADDRESS"), 3).await;
        assert!(matches!(result, Err(DimseError::Config(_))));
    }
}
