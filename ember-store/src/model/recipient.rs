use serde::{Deserialize, Serialize};

use crate::types::{ListId, SegmentId, SubscriberId};

/// Who a campaign goes to: a segment of a list, or every active subscriber
/// of the list when no segment is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Audience {
    pub list_id: ListId,
    #[serde(default)]
    pub segment_id: Option<SegmentId>,
}

/// An active subscriber as handed out by a recipient source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default = "SubscriberId::generate")]
    pub subscriber_id: SubscriberId,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Recipient {
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            subscriber_id: SubscriberId::generate(),
            email: email.into(),
            name: None,
        }
    }
}
