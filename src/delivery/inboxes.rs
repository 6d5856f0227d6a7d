//! Recipient resolution: which inbox URLs an activity has to be POSTed to.

use url::Url;

use super::message::{InboxTarget, RecipientMap};

/// The delivery-relevant part of a recipient actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub id: Option<Url>,
    pub inbox: Option<Url>,
    /// `endpoints.sharedInbox`
    pub shared_inbox: Option<Url>,
}

impl Recipient {
    pub fn new(id: Url, inbox: Url) -> Self {
        Self {
            id: Some(id),
            inbox: Some(inbox),
            shared_inbox: None,
        }
    }

    pub fn with_shared_inbox(mut self, shared_inbox: Url) -> Self {
        self.shared_inbox = Some(shared_inbox);
        self
    }
}

/// Group recipients by the inbox that should receive the activity.
///
/// With `prefer_shared_inbox` actors on the same server collapse onto their
/// shared inbox. Inboxes on the same origin as any of `excluded_base_uris`
/// (normally the local server) are skipped, as are recipients without an
/// inbox.
pub fn extract_inboxes(
    recipients: &[Recipient],
    prefer_shared_inbox: bool,
    excluded_base_uris: &[Url],
) -> RecipientMap {
    let mut inboxes = RecipientMap::new();

    for recipient in recipients {
        let (inbox, shared) = match (&recipient.shared_inbox, &recipient.inbox) {
            (Some(shared), _) if prefer_shared_inbox => (shared, true),
            (_, Some(inbox)) => (inbox, false),
            _ => continue,
        };

        if excluded_base_uris
            .iter()
            .any(|base| base.origin() == inbox.origin())
        {
            continue;
        }

        let target = inboxes.entry(inbox.clone()).or_insert_with(|| InboxTarget {
            actor_ids: Vec::new(),
            shared_inbox: shared,
        });
        if let Some(id) = &recipient.id {
            if !target.actor_ids.contains(id) {
                target.actor_ids.push(id.clone());
            }
        }
    }

    inboxes
}
