//! Bottom-up status aggregation.
//!
//! Parent status is a pure function of the children's statuses. Both rules are
//! evaluated from scratch on every notification, so duplicated or reordered
//! notifications converge on the same answer.

use crate::status::{MessageStatus, PublicationStatus, RequestStatus, Status};

/// Status a send request should take given all of its messages' statuses.
///
/// `None` means "leave unchanged": some message is still in flight, or there
/// are no messages at all.
pub fn aggregate_request(messages: &[MessageStatus]) -> Option<RequestStatus> {
    if messages.is_empty() || !messages.iter().all(|s| s.is_terminal()) {
        return None;
    }
    if messages.iter().all(|s| *s == MessageStatus::Sent) {
        Some(RequestStatus::Sent)
    } else {
        Some(RequestStatus::Failed)
    }
}

/// Status a publication (or one recurring cycle) should take given the
/// statuses of its send requests.
///
/// - all SENT: POSTED
/// - all terminal, at least one SENT: FAILED (partial success fails the batch)
/// - all terminal, none SENT, only FAILED/STALE: STALE
/// - all terminal, none SENT, some CANCELLED: CANCELED
/// - otherwise `None` (still pending)
pub fn aggregate_publication(requests: &[RequestStatus]) -> Option<PublicationStatus> {
    if requests.is_empty() || !requests.iter().all(|s| s.is_terminal()) {
        return None;
    }

    let sent = requests.iter().filter(|s| **s == RequestStatus::Sent).count();
    if sent == requests.len() {
        return Some(PublicationStatus::Posted);
    }
    if sent > 0 {
        return Some(PublicationStatus::Failed);
    }
    if requests
        .iter()
        .all(|s| matches!(s, RequestStatus::Failed | RequestStatus::Stale))
    {
        return Some(PublicationStatus::Stale);
    }
    Some(PublicationStatus::Canceled)
}
