//! Crash-recovery sweep run at channel start.
//!
//! Scoped to this host's server id: unfinished messages from other cluster
//! members are left alone. Connector messages still in RECEIVED or PENDING
//! are deterministically resolved to ERROR; QUEUED and TRANSFORMED
//! destinations are not touched, the queue workers resume them. Each
//! message recovers in its own transaction so one failure never aborts the
//! sweep.

use tracing::{error, info};

use crate::message::{ChannelId, ServerId};
use crate::settings::StorageSettings;
use crate::store::{MessageStore, StoreError};

/// Outcome of a recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Messages closed by the sweep.
    pub recovered: u64,
    /// Messages whose recovery failed and was skipped.
    pub errors: u64,
}

/// Runs the sweep. Idempotent: a second run over a recovered channel
/// performs zero mutations.
///
/// # Errors
///
/// Returns a store error only when the initial unfinished-message scan
/// fails; per-message failures are logged and counted in the report.
pub async fn run_recovery(
    store: &dyn MessageStore,
    channel_id: &ChannelId,
    server_id: &ServerId,
    settings: &StorageSettings,
) -> Result<RecoveryReport, StoreError> {
    let unfinished = store
        .get_unfinished_message_ids(channel_id, server_id)
        .await?;
    if unfinished.is_empty() {
        return Ok(RecoveryReport::default());
    }

    let mut report = RecoveryReport::default();
    for message_id in unfinished {
        match store.recover_message(channel_id, message_id, settings).await {
            Ok(recovered_connectors) => {
                for connector in &recovered_connectors {
                    info!(
                        %message_id,
                        meta_data_id = %connector.meta_data_id,
                        original_status = %connector.original_status,
                        "connector message recovered after restart"
                    );
                }
                report.recovered += 1;
            }
            Err(e) => {
                // One bad message must not abort the sweep.
                error!(%message_id, error = %e, "failed to recover message, skipping");
                report.errors += 1;
            }
        }
    }

    info!(
        recovered = report.recovered,
        errors = report.errors,
        "recovery sweep finished"
    );
    Ok(report)
}
