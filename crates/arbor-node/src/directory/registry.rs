//! The client directory: username → [`Record`].
//!
//! Owns every mutation of client identity state — registration (including
//! the distributed-lock bookkeeping driven by the coordinator), login and
//! logout transitions, activity creation, receipt application, and snapshot
//! production/merge for server authentication.

use crate::directory::record::{Delivery, Message, Record, Token};
use crate::errors::NodeError;
use arbor_protocol::{DeliverySnapshot, DirectorySnapshot, RecordSnapshot};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Username clients present to log in anonymously; also the reserved prefix
/// identifying replicated anonymous records.
pub const ANONYMOUS_USERNAME: &str = "anonymous";

/// Whether a username denotes an anonymous identity.
#[must_use]
pub fn is_anonymous_username(username: &str) -> bool {
    username.starts_with(ANONYMOUS_USERNAME)
}

/// Generate a unique directory key for one anonymous login.
#[must_use]
pub fn generate_anonymous_username() -> String {
    format!("{ANONYMOUS_USERNAME}-{:08x}", rand::random::<u32>())
}

/// An activity accepted into the directory, ready to broadcast.
#[derive(Debug, Clone)]
pub struct CreatedActivity {
    /// Token assigned by the sender's record.
    pub token: Token,
    /// The processed activity (authenticated user already injected).
    pub activity: serde_json::Value,
    /// Wire form of the delivery state at creation.
    pub delivery: DeliverySnapshot,
}

/// One message owed to a locally connected client.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Username of the record holding the message.
    pub origin: String,
    /// Token within that record.
    pub token: Token,
    /// The activity to hand over.
    pub activity: serde_json::Value,
    /// Delivery state at hand-over time, for the client-bound frame.
    pub delivery: DeliverySnapshot,
}

/// The directory of client identities and their pending messages.
///
/// Iteration order is the key order of the underlying `BTreeMap`, which
/// keeps sweeps and snapshots deterministic.
#[derive(Debug, Default)]
pub struct ClientDirectory {
    records: BTreeMap<String, Record>,
}

impl ClientDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.records.contains_key(username)
    }

    #[must_use]
    pub fn get(&self, username: &str) -> Option<&Record> {
        self.records.get(username)
    }

    pub fn get_mut(&mut self, username: &str) -> Option<&mut Record> {
        self.records.get_mut(username)
    }

    /// All usernames currently in the directory.
    #[must_use]
    pub fn usernames(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Store a freshly registered user. Fails when the username is taken.
    pub fn insert_registered(
        &mut self,
        username: &str,
        secret: &str,
    ) -> Result<(), NodeError> {
        match self.records.entry(username.to_string()) {
            Entry::Occupied(_) => Err(NodeError::RegistrationConflict(username.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Record::registered(username, secret));
                Ok(())
            }
        }
    }

    /// Store a fresh anonymous identity (born logged in).
    pub fn insert_anonymous(&mut self, username: &str) {
        self.records
            .entry(username.to_string())
            .or_insert_with(|| Record::anonymous(username));
    }

    /// Store a username claimed by a LOCK_REQUEST from elsewhere in the
    /// tree. Anonymous-prefixed names become anonymous records; the caller
    /// has already checked for conflicts.
    pub fn store_locked(&mut self, username: &str, secret: &str) {
        let record = if is_anonymous_username(username) {
            Record::anonymous(username)
        } else {
            Record::registered(username, secret)
        };
        self.records.insert(username.to_string(), record);
    }

    /// Drop a username (lock denial, or anonymous logout).
    pub fn remove(&mut self, username: &str) -> Option<Record> {
        self.records.remove(username)
    }

    /// Check a LOGIN attempt against the stored record.
    pub fn verify_login(&self, username: &str, secret: &str) -> Result<(), NodeError> {
        let record = self
            .records
            .get(username)
            .ok_or(NodeError::CredentialMismatch)?;
        if record.secret_matches(secret) {
            Ok(())
        } else {
            Err(NodeError::CredentialMismatch)
        }
    }

    /// Accept an activity from `sender`, assign it the record's next token,
    /// and store it addressed to every username currently in the directory
    /// (the sender included; its echo is its delivery). Activities from
    /// anonymous records use the counted variant.
    pub fn create_activity(
        &mut self,
        sender: &str,
        activity: serde_json::Value,
    ) -> Result<CreatedActivity, NodeError> {
        let recipients: BTreeSet<String> = self.records.keys().cloned().collect();
        let record = self
            .records
            .get_mut(sender)
            .ok_or_else(|| NodeError::Internal(format!("no record for sender {sender}")))?;

        let token = record.next_token();
        let delivery = if record.is_anonymous() {
            Delivery::Counted {
                outstanding: recipients.len() as u64,
                delivered_here: false,
            }
        } else {
            Delivery::Named {
                all: recipients.clone(),
                remaining: recipients,
            }
        };
        let wire_delivery = delivery.to_snapshot();

        record.insert_or_merge(Message {
            token,
            activity: activity.clone(),
            delivery,
        });

        Ok(CreatedActivity {
            token,
            activity,
            delivery: wire_delivery,
        })
    }

    /// Apply a replicated activity broadcast. Returns false when the origin
    /// record is unknown here (the caller still forwards the flood).
    pub fn apply_remote_activity(
        &mut self,
        username: &str,
        token: Token,
        activity: serde_json::Value,
        delivery: &DeliverySnapshot,
    ) -> bool {
        let Some(record) = self.records.get_mut(username) else {
            debug!(
                target: "arbor.directory",
                username = %username,
                token = token,
                "activity broadcast for unknown record"
            );
            return false;
        };
        record.insert_or_merge(Message {
            token,
            activity,
            delivery: Delivery::from_snapshot(delivery),
        });
        true
    }

    /// Apply a flooded delivery receipt.
    pub fn apply_delivered(
        &mut self,
        username: &str,
        token: Token,
        recipient: Option<&str>,
        count: Option<u64>,
    ) -> bool {
        let Some(record) = self.records.get_mut(username) else {
            return false;
        };
        match (recipient, count) {
            (Some(recipient), _) => record.mark_delivered(token, recipient),
            (None, Some(count)) => record.apply_counted_receipt(token, count),
            (None, None) => false,
        }
    }

    /// Apply a replicated logout. `seq` is the login-state sequence number
    /// carried by the broadcast; stale or duplicate broadcasts are no-ops.
    pub fn apply_logout_broadcast(&mut self, username: &str, seq: u64) -> bool {
        self.records
            .get_mut(username)
            .is_some_and(|record| record.apply_login_update(seq, false))
    }

    /// Apply a replicated anonymous logout: the ephemeral record is deleted.
    pub fn apply_anon_logout(&mut self, username: &str) -> bool {
        if self.records.get(username).is_some_and(Record::is_anonymous) {
            self.records.remove(username);
            true
        } else {
            false
        }
    }

    /// Pull every message currently owed to `user`, marking each delivered
    /// here. Per-origin token order is preserved.
    pub fn drain_named_for(&mut self, user: &str) -> Vec<PendingDelivery> {
        let mut out = Vec::new();
        for record in self.records.values_mut() {
            while let Some((token, activity, delivery)) = record
                .next_message_for(user)
                .map(|m| (m.token, m.activity.clone(), m.delivery.to_snapshot()))
            {
                record.mark_delivered(token, user);
                out.push(PendingDelivery {
                    origin: record.username().to_string(),
                    token,
                    activity,
                    delivery,
                });
            }
        }
        out
    }

    /// Counted messages this node has not yet fanned out to its local
    /// clients. The caller delivers them, applies the decrement, and floods
    /// the receipt.
    pub fn take_counted_fanouts(&mut self) -> Vec<PendingDelivery> {
        let mut out = Vec::new();
        for record in self.records.values_mut() {
            let origin = record.username().to_string();
            for (token, activity, outstanding) in record.take_counted_fanout() {
                out.push(PendingDelivery {
                    origin: origin.clone(),
                    token,
                    activity,
                    delivery: DeliverySnapshot::Counted { outstanding },
                });
            }
        }
        out
    }

    /// Snapshot the whole directory for replication.
    #[must_use]
    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            records: self.records.values().map(Record::snapshot).collect(),
        }
    }

    /// Merge a replica's snapshot: known records reconcile field by field,
    /// unknown ones are created.
    pub fn merge_snapshot(&mut self, snapshot: &DirectorySnapshot) {
        for remote in &snapshot.records {
            match self.records.entry(remote.username.clone()) {
                Entry::Occupied(mut slot) => slot.get_mut().merge_remote(remote),
                Entry::Vacant(slot) => {
                    slot.insert(Record::from_snapshot(remote));
                }
            }
        }
    }

    /// Snapshot a single record, if present.
    #[must_use]
    pub fn record_snapshot(&self, username: &str) -> Option<RecordSnapshot> {
        self.records.get(username).map(Record::snapshot)
    }
}
