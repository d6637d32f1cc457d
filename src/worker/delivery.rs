//! Result delivery with retry across reconnects.

use std::time::Duration;

use tracing::{error, warn};

use super::link::HubLink;
use crate::error::WorkerError;
use crate::protocol::AgentMessage;

/// Send `msg` through whatever connection is current, retrying with
/// exponential backoff (`base`, `2*base`, `4*base`, ...). An attempt counts
/// only once the writer has put the frame on the socket.
///
/// On exhaustion the message is logged in full so the output is not lost
/// without a trace.
pub async fn deliver_with_retry(
    link: &HubLink,
    msg: AgentMessage,
    attempts: u32,
    base: Duration,
) -> Result<(), WorkerError> {
    let attempts = attempts.max(1);
    let mut delay = base;

    for attempt in 1..=attempts {
        match link.send_confirmed(msg.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    kind = msg.kind(),
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Delivery to hub failed"
                );
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    let task_id = match &msg {
        AgentMessage::Result { task_id, output, .. } => {
            error!(task_id = %task_id, output = %output, "Result lost after retries");
            Some(*task_id)
        }
        AgentMessage::Killed { task_id } => {
            error!(task_id = %task_id, "Killed notice lost after retries");
            Some(*task_id)
        }
        other => {
            error!(kind = other.kind(), "Message lost after retries");
            None
        }
    };
    Err(WorkerError::ResultDelivery {
        task_id: task_id.unwrap_or_default(),
        attempts,
    })
}
