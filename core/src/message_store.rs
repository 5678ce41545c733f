/// Ordered, deduplicated message collection for one conversation
///
/// Reads always come back sorted by `(date, time, arrival)`. The sort is done
/// lazily and cached until the next mutation, so inserts stay cheap when the
/// channel is busy.
use crate::message::{Fingerprint, Message};
use chrono::NaiveDate;
use std::cell::OnceCell;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    arrival: u64,
}

/// Consecutive messages sharing a calendar date, for date separators
#[derive(Debug, Clone, PartialEq)]
pub struct DateGroup {
    pub date: NaiveDate,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<Entry>,
    seen_ids: HashSet<String>,
    /// fingerprint -> server ids of the entries carrying it (None when absent)
    seen_fingerprints: HashMap<Fingerprint, Vec<Option<String>>>,
    next_arrival: u64,
    seeded: bool,
    order: OnceCell<Vec<usize>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install fetched history. Only the first call has any effect.
    ///
    /// Messages inserted before the seed (channel events racing the history
    /// fetch) are kept and deduplicated against the history.
    pub fn seed(&mut self, messages: Vec<Message>) -> bool {
        if self.seeded {
            warn!("MessageStore already seeded, ignoring {} messages", messages.len());
            return false;
        }
        self.seeded = true;

        let live = std::mem::take(&mut self.entries);
        self.seen_ids.clear();
        self.seen_fingerprints.clear();
        self.order = OnceCell::new();

        let history_len = messages.len();
        for message in messages {
            self.push(message, None);
        }
        let mut raced = 0;
        for entry in live {
            if self.push(entry.message, Some(entry.arrival)) {
                raced += 1;
            }
        }

        debug!(
            "Seeded store with {} history messages ({} live messages kept)",
            history_len, raced
        );
        true
    }

    /// Merge one message. Returns false if it was already present.
    pub fn insert(&mut self, message: Message) -> bool {
        let inserted = self.push(message, None);
        if !inserted {
            debug!("Duplicate message ignored");
        }
        inserted
    }

    fn push(&mut self, message: Message, arrival: Option<u64>) -> bool {
        let fingerprint = message.fingerprint();
        if self.is_duplicate(&message, &fingerprint) {
            return false;
        }

        if let Some(id) = &message.sequence_hint {
            self.seen_ids.insert(id.clone());
        }
        self.seen_fingerprints
            .entry(fingerprint)
            .or_default()
            .push(message.sequence_hint.clone());

        let arrival = arrival.unwrap_or_else(|| {
            self.next_arrival += 1;
            self.next_arrival
        });
        self.entries.push(Entry { message, arrival });
        self.order = OnceCell::new();
        true
    }

    /// Exact on server ids when both sides carry one, fingerprint otherwise
    fn is_duplicate(&mut self, message: &Message, fingerprint: &Fingerprint) -> bool {
        if let Some(id) = &message.sequence_hint {
            if self.seen_ids.contains(id) {
                return true;
            }
        }

        let Some(ids) = self.seen_fingerprints.get_mut(fingerprint) else {
            return false;
        };
        match &message.sequence_hint {
            None => true,
            Some(id) => {
                // Same content but a distinct server id is a distinct message,
                // unless the stored copy never had an id
                match ids.iter_mut().find(|existing| existing.is_none()) {
                    Some(slot) => {
                        *slot = Some(id.clone());
                        self.seen_ids.insert(id.clone());
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn order(&self) -> &[usize] {
        self.order.get_or_init(|| {
            let mut idx: Vec<usize> = (0..self.entries.len()).collect();
            idx.sort_by_key(|&i| (self.entries[i].message.sort_key(), self.entries[i].arrival));
            idx
        })
    }

    /// All messages, sorted by (date, time, arrival)
    pub fn ordered_view(&self) -> Vec<Message> {
        self.ordered_view_filtered(|_| true)
    }

    /// Sorted messages satisfying `filter`
    pub fn ordered_view_filtered<F>(&self, filter: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        self.order()
            .iter()
            .map(|&i| &self.entries[i].message)
            .filter(|m| filter(*m))
            .cloned()
            .collect()
    }

    pub fn group_by_date(&self) -> Vec<DateGroup> {
        let mut groups: Vec<DateGroup> = Vec::new();
        for message in self.ordered_view() {
            match groups.last_mut() {
                Some(group) if group.date == message.sent_at_date => group.messages.push(message),
                _ => groups.push(DateGroup {
                    date: message.sent_at_date,
                    messages: vec![message],
                }),
            }
        }
        groups
    }

    /// Most recent message in display order
    pub fn last(&self) -> Option<Message> {
        self.order()
            .last()
            .map(|&i| self.entries[i].message.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }
}

/// Filter: messages belonging to `conversation_id`
pub fn in_conversation(conversation_id: &str) -> impl Fn(&Message) -> bool + '_ {
    move |m| m.conversation_id == conversation_id
}

/// Filter: report references only
pub fn reports_only(message: &Message) -> bool {
    message.is_report()
}
