//! Per-username directory record: token counter, ordered message log, and
//! login state.
//!
//! A record owns the messages its user has sent. Tokens are assigned
//! monotonically per record and wrap from [`TOKEN_MAX`] back to 1 (a sequence
//! restart, not an error). The deliverable log only ever contains an
//! unbroken run of tokens up to `received_up_to`; anything that arrives out
//! of order waits in the undeliverable queue until its predecessors show up.
//!
//! Login state is an explicit `(seq, logged_in)` pair: an update is applied
//! only when its sequence number is strictly greater than the stored one, so
//! duplicate or reordered logout broadcasts are no-ops.

use arbor_protocol::{DeliverySnapshot, MessageSnapshot, RecordKindSnapshot, RecordSnapshot};
use std::collections::BTreeSet;

/// Per-record message sequence number.
pub type Token = u64;

/// Highest representable token; the next token after this is 1.
pub const TOKEN_MAX: Token = u64::MAX;

/// The token following `token`, wrapping past [`TOKEN_MAX`] to 1.
#[must_use]
pub const fn successor(token: Token) -> Token {
    if token == TOKEN_MAX {
        1
    } else {
        token + 1
    }
}

/// Delivery-tracking state of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Recipient set fixed at creation; `remaining` shrinks as receipts
    /// arrive and the message dies when it empties.
    Named {
        all: BTreeSet<String>,
        remaining: BTreeSet<String>,
    },
    /// Anonymous-origin fan-out tracked as a countdown. `delivered_here`
    /// records that this node already fanned the message out to its local
    /// clients; it never goes on the wire.
    Counted { outstanding: u64, delivered_here: bool },
}

impl Delivery {
    /// True once nobody is left to deliver to.
    #[must_use]
    pub fn is_spent(&self) -> bool {
        match self {
            Delivery::Named { remaining, .. } => remaining.is_empty(),
            Delivery::Counted { outstanding, .. } => *outstanding == 0,
        }
    }

    /// Merge a replica's view: a recipient counts as delivered if either
    /// side has removed it, so `remaining` is the intersection and counts
    /// take the minimum.
    fn merge_from(&mut self, remote: &DeliverySnapshot) {
        match (self, remote) {
            (
                Delivery::Named { remaining, .. },
                DeliverySnapshot::Named {
                    remaining: remote_remaining,
                    ..
                },
            ) => {
                remaining.retain(|r| remote_remaining.contains(r));
            }
            (
                Delivery::Counted { outstanding, .. },
                DeliverySnapshot::Counted {
                    outstanding: remote_outstanding,
                },
            ) => {
                *outstanding = (*outstanding).min(*remote_outstanding);
            }
            // Variant disagreement between replicas should not happen; the
            // local view wins.
            _ => {}
        }
    }

    /// Wire form of this delivery state.
    #[must_use]
    pub fn to_snapshot(&self) -> DeliverySnapshot {
        match self {
            Delivery::Named { all, remaining } => DeliverySnapshot::Named {
                all: all.iter().cloned().collect(),
                remaining: remaining.iter().cloned().collect(),
            },
            Delivery::Counted { outstanding, .. } => DeliverySnapshot::Counted {
                outstanding: *outstanding,
            },
        }
    }

    /// Rebuild delivery state from its wire form.
    #[must_use]
    pub fn from_snapshot(snapshot: &DeliverySnapshot) -> Self {
        match snapshot {
            DeliverySnapshot::Named { all, remaining } => Delivery::Named {
                all: all.iter().cloned().collect(),
                remaining: remaining.iter().cloned().collect(),
            },
            DeliverySnapshot::Counted { outstanding } => Delivery::Counted {
                outstanding: *outstanding,
                delivered_here: false,
            },
        }
    }
}

/// One pending message in a record's log.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub token: Token,
    pub activity: serde_json::Value,
    pub delivery: Delivery,
}

impl Message {
    fn to_snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            token: self.token,
            activity: self.activity.clone(),
            delivery: self.delivery.to_snapshot(),
        }
    }

    fn from_snapshot(snapshot: &MessageSnapshot) -> Self {
        Message {
            token: snapshot.token,
            activity: snapshot.activity.clone(),
            delivery: Delivery::from_snapshot(&snapshot.delivery),
        }
    }
}

/// Record variant: registered users carry their credential, anonymous
/// identities are ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Registered { secret: String },
    Anonymous,
}

/// Explicit login state: `seq` increases on every transition and remote
/// updates are accepted only when strictly newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginState {
    pub seq: u64,
    pub logged_in: bool,
}

/// A per-username directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    username: String,
    kind: RecordKind,
    next_token: Token,
    received_up_to: Token,
    messages: Vec<Message>,
    undeliverable: Vec<Message>,
    login: LoginState,
}

impl Record {
    /// A freshly registered user: logged out, no messages yet.
    #[must_use]
    pub fn registered(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: RecordKind::Registered {
                secret: secret.into(),
            },
            next_token: 1,
            received_up_to: 0,
            messages: Vec::new(),
            undeliverable: Vec::new(),
            login: LoginState {
                seq: 0,
                logged_in: false,
            },
        }
    }

    /// A fresh anonymous identity: born logged in.
    #[must_use]
    pub fn anonymous(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: RecordKind::Anonymous,
            next_token: 1,
            received_up_to: 0,
            messages: Vec::new(),
            undeliverable: Vec::new(),
            login: LoginState {
                seq: 1,
                logged_in: true,
            },
        }
    }

    /// Rebuild a record from a replica's snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &RecordSnapshot) -> Self {
        let kind = match &snapshot.kind {
            RecordKindSnapshot::Registered { secret } => RecordKind::Registered {
                secret: secret.clone(),
            },
            RecordKindSnapshot::Anonymous => RecordKind::Anonymous,
        };
        let mut record = Self {
            username: snapshot.username.clone(),
            kind,
            next_token: snapshot.next_token,
            received_up_to: snapshot.received_up_to,
            messages: Vec::new(),
            undeliverable: Vec::new(),
            login: LoginState {
                seq: snapshot.login_seq,
                logged_in: snapshot.logged_in,
            },
        };
        for message in snapshot.messages.iter().chain(&snapshot.undeliverable) {
            record.adopt_remote(Message::from_snapshot(message));
        }
        record
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, RecordKind::Anonymous)
    }

    /// True when `candidate` matches a registered record's stored secret.
    /// Anonymous records have no credential and never match.
    #[must_use]
    pub fn secret_matches(&self, candidate: &str) -> bool {
        match &self.kind {
            RecordKind::Registered { secret } => secret == candidate,
            RecordKind::Anonymous => false,
        }
    }

    #[must_use]
    pub const fn received_up_to(&self) -> Token {
        self.received_up_to
    }

    #[must_use]
    pub const fn logged_in(&self) -> bool {
        self.login.logged_in
    }

    #[must_use]
    pub const fn login_seq(&self) -> u64 {
        self.login.seq
    }

    #[must_use]
    pub fn deliverable(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn undeliverable(&self) -> &[Message] {
        &self.undeliverable
    }

    /// Return the next token and advance the counter, wrapping past
    /// [`TOKEN_MAX`] to 1.
    pub fn next_token(&mut self) -> Token {
        let token = self.next_token;
        self.next_token = successor(token);
        token
    }

    /// Record a local login/logout transition. Returns the new sequence
    /// number when the state actually changed, None when it was already in
    /// the requested state.
    pub fn set_logged_in(&mut self, logged_in: bool) -> Option<u64> {
        if self.login.logged_in == logged_in {
            return None;
        }
        self.login.seq += 1;
        self.login.logged_in = logged_in;
        Some(self.login.seq)
    }

    /// Apply a replicated login-state update. Accepted only when `seq` is
    /// strictly greater than the stored sequence; duplicates are no-ops.
    pub fn apply_login_update(&mut self, seq: u64, logged_in: bool) -> bool {
        if seq <= self.login.seq {
            return false;
        }
        self.login = LoginState { seq, logged_in };
        true
    }

    /// Insert a message, or merge delivery state when its token is already
    /// known.
    ///
    /// A message whose token is the successor of the watermark lands in the
    /// deliverable log and advances the watermark, promoting any
    /// now-contiguous successors. Anything else waits in the undeliverable
    /// queue, sorted by token. A token at or below the watermark that is no
    /// longer present was already fully delivered here; a re-flooded copy
    /// is dropped rather than resurrected.
    pub fn insert_or_merge(&mut self, incoming: Message) {
        if self.find_and_merge(&incoming) || incoming.delivery.is_spent() {
            return;
        }
        if incoming.token == successor(self.received_up_to) {
            self.received_up_to = incoming.token;
            self.messages.push(incoming);
            self.promote_contiguous();
        } else if !self.is_past(incoming.token) {
            let insert_at = self
                .undeliverable
                .iter()
                .position(|m| m.token > incoming.token)
                .unwrap_or(self.undeliverable.len());
            self.undeliverable.insert(insert_at, incoming);
        }
    }

    /// Adopt a message from a replica's snapshot.
    ///
    /// Unlike the broadcast path, a token at or below the watermark that is
    /// absent here stays deliverable: the replica kept it because someone
    /// has not acknowledged it yet, and our watermark already covers it
    /// (the log tolerates gaps below the watermark where spent entries were
    /// removed).
    fn adopt_remote(&mut self, incoming: Message) {
        if self.find_and_merge(&incoming) || incoming.delivery.is_spent() {
            return;
        }
        if self.is_past(incoming.token) {
            let insert_at = self
                .messages
                .iter()
                .position(|m| m.token > incoming.token)
                .unwrap_or(self.messages.len());
            self.messages.insert(insert_at, incoming);
        } else if incoming.token == successor(self.received_up_to) {
            self.received_up_to = incoming.token;
            self.messages.push(incoming);
            self.promote_contiguous();
        } else {
            let insert_at = self
                .undeliverable
                .iter()
                .position(|m| m.token > incoming.token)
                .unwrap_or(self.undeliverable.len());
            self.undeliverable.insert(insert_at, incoming);
        }
    }

    /// Merge into an existing entry with the same token, in either log.
    /// Returns false when the token is unknown.
    fn find_and_merge(&mut self, incoming: &Message) -> bool {
        if let Some(index) = self.messages.iter().position(|m| m.token == incoming.token) {
            Self::merge_into(&mut self.messages, index, incoming);
            return true;
        }
        if let Some(index) = self
            .undeliverable
            .iter()
            .position(|m| m.token == incoming.token)
        {
            Self::merge_into(&mut self.undeliverable, index, incoming);
            return true;
        }
        false
    }

    fn merge_into(log: &mut Vec<Message>, index: usize, incoming: &Message) {
        if let Some(existing) = log.get_mut(index) {
            existing.delivery.merge_from(&incoming.delivery.to_snapshot());
            if existing.delivery.is_spent() {
                log.remove(index);
            }
        }
    }

    /// Whether `token` falls at or below the watermark, i.e. its delivery
    /// slot has already passed.
    fn is_past(&self, token: Token) -> bool {
        // Comparing across a wrapped sequence is meaningless; only the
        // plain ordering is checked, matching the restart semantics.
        token <= self.received_up_to
    }

    /// Promote undeliverable successors in ascending token order, stopping
    /// at the first gap.
    fn promote_contiguous(&mut self) {
        loop {
            let next = successor(self.received_up_to);
            let Some(index) = self.undeliverable.iter().position(|m| m.token == next) else {
                break;
            };
            let message = self.undeliverable.remove(index);
            self.received_up_to = next;
            self.messages.push(message);
        }
    }

    /// Remove `recipient` from the message with `token`; the message dies
    /// when nobody remains. Returns true when anything changed.
    pub fn mark_delivered(&mut self, token: Token, recipient: &str) -> bool {
        for log in [&mut self.messages, &mut self.undeliverable] {
            if let Some(index) = log.iter().position(|m| m.token == token) {
                let Some(message) = log.get_mut(index) else {
                    return false;
                };
                let Delivery::Named { remaining, .. } = &mut message.delivery else {
                    return false;
                };
                let removed = remaining.remove(recipient);
                if message.delivery.is_spent() {
                    log.remove(index);
                }
                return removed;
            }
        }
        false
    }

    /// Decrement a counted message's outstanding deliveries; the message
    /// dies at zero.
    pub fn apply_counted_receipt(&mut self, token: Token, count: u64) -> bool {
        for log in [&mut self.messages, &mut self.undeliverable] {
            if let Some(index) = log.iter().position(|m| m.token == token) {
                let Some(message) = log.get_mut(index) else {
                    return false;
                };
                let Delivery::Counted { outstanding, .. } = &mut message.delivery else {
                    return false;
                };
                *outstanding = outstanding.saturating_sub(count);
                if message.delivery.is_spent() {
                    log.remove(index);
                }
                return true;
            }
        }
        false
    }

    /// First deliverable message still addressed to `user`, in token order.
    #[must_use]
    pub fn next_message_for(&self, user: &str) -> Option<&Message> {
        self.messages.iter().find(|m| match &m.delivery {
            Delivery::Named { remaining, .. } => remaining.contains(user),
            Delivery::Counted { .. } => false,
        })
    }

    /// Deliverable counted messages this node has not yet fanned out to its
    /// local clients; marks them fanned out. Each entry is
    /// `(token, activity, outstanding)`.
    pub fn take_counted_fanout(&mut self) -> Vec<(Token, serde_json::Value, u64)> {
        let mut taken = Vec::new();
        for message in &mut self.messages {
            if let Delivery::Counted {
                outstanding,
                delivered_here,
            } = &mut message.delivery
            {
                if !*delivered_here && *outstanding > 0 {
                    *delivered_here = true;
                    taken.push((message.token, message.activity.clone(), *outstanding));
                }
            }
        }
        taken
    }

    /// Merge a replica's view of this record.
    ///
    /// The watermark only ever advances (wraparound is normalized to 1 by
    /// the insertion path); messages merge by token identity; the login
    /// state follows the accept-if-strictly-greater rule.
    pub fn merge_remote(&mut self, snapshot: &RecordSnapshot) {
        self.apply_login_update(snapshot.login_seq, snapshot.logged_in);
        if snapshot.next_token > self.next_token {
            self.next_token = snapshot.next_token;
        }
        if snapshot.received_up_to > self.received_up_to {
            self.received_up_to = snapshot.received_up_to;
            // Entries the remote has already walked past become deliverable.
            let mut index = 0;
            while index < self.undeliverable.len() {
                if self
                    .undeliverable
                    .get(index)
                    .is_some_and(|m| m.token <= self.received_up_to)
                {
                    let message = self.undeliverable.remove(index);
                    self.messages.push(message);
                } else {
                    index += 1;
                }
            }
            self.messages.sort_by_key(|m| m.token);
            self.promote_contiguous();
        }
        for message in snapshot.messages.iter().chain(&snapshot.undeliverable) {
            self.adopt_remote(Message::from_snapshot(message));
        }
    }

    /// Snapshot this record for replication.
    #[must_use]
    pub fn snapshot(&self) -> RecordSnapshot {
        let kind = match &self.kind {
            RecordKind::Registered { secret } => RecordKindSnapshot::Registered {
                secret: secret.clone(),
            },
            RecordKind::Anonymous => RecordKindSnapshot::Anonymous,
        };
        RecordSnapshot {
            username: self.username.clone(),
            kind,
            next_token: self.next_token,
            received_up_to: self.received_up_to,
            login_seq: self.login.seq,
            logged_in: self.login.logged_in,
            messages: self.messages.iter().map(Message::to_snapshot).collect(),
            undeliverable: self
                .undeliverable
                .iter()
                .map(Message::to_snapshot)
                .collect(),
        }
    }
}
