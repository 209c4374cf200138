//! Startup reconciliation of the store against the chat channel.
//!
//! Across a restart the store may reference cards that were deleted while the
//! service was down. A request whose card is confirmed gone can never receive
//! a decision, so it is dropped. Any transient failure, whether checking the
//! card or dropping the row, keeps the request: a kept orphan is retried on
//! the next restart, while a wrongly dropped request loses a live card.

use std::sync::Arc;
use tracing::{info, warn};

use crate::chat::ChatApi;
use crate::tracker::repository::RequestRepository;
use crate::tracker::state::ChannelId;

pub async fn reconcile_pending_requests(
    repository: &Arc<dyn RequestRepository>,
    chat: &Arc<dyn ChatApi>,
    review_channel: ChannelId,
) -> anyhow::Result<usize> {
    let pending = repository.get_pending().await?;
    let total = pending.len();
    let mut dropped = 0;

    for request in pending {
        match chat.message_exists(review_channel, request.card).await {
            Ok(true) => {}
            Ok(false) => match repository.delete(&request.card).await {
                Ok(_) => {
                    warn!(card = %request.card, "card gone, dropped orphaned request");
                    dropped += 1;
                }
                Err(e) => {
                    warn!(card = %request.card, error = %e, "could not drop orphaned request, keeping it");
                }
            },
            Err(e) => {
                warn!(card = %request.card, error = %e, "could not verify card, keeping request");
            }
        }
    }

    info!(total, dropped, "reconciled pending requests");
    Ok(total - dropped)
}
