//! Conversation Replay
//!
//! Re-emits a stored conversation with the same framing used for live
//! streaming, so a reconnecting client can rebuild its view from frames alone.

use crate::delivery::{DeliveryError, DeliverySink};
use crate::messages::HubFrame;
use crate::session::Conversation;

/// Replay `conversation` through `sink`
///
/// Each visible turn becomes `Start{Role}Response`, its text as one event,
/// then `End{Role}Response`. Returns the number of turns replayed.
pub async fn replay_conversation<D>(
    conversation: &Conversation,
    sink: &D,
) -> Result<usize, DeliveryError>
where
    D: DeliverySink + ?Sized,
{
    let mut turns = 0;
    for message in conversation.replayable() {
        sink.deliver(HubFrame::start(message.role)).await?;
        sink.deliver(HubFrame::text(message.text.clone())).await?;
        sink.deliver(HubFrame::end(message.role)).await?;
        turns += 1;
    }
    Ok(turns)
}
