//! This node's view of the server tree.
//!
//! Tracks the parent/grandparent/sibling links, the authenticated children
//! (the first of which is the anchor "root child"), and the known-server
//! table fed by load gossip. The table keeps insertion order, which is the
//! documented iteration order for redirect target selection.
//!
//! Reconnection policy after a parent loss lives here as a pure decision
//! ([`ServerTopology::reconnect_plan`]); the coordinator executes it.

use arbor_protocol::PeerInfo;

/// A server somewhere in the tree, as this node sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNode {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    /// Client count from the most recent announce.
    pub load: u64,
    pub connected: bool,
    pub timed_out: bool,
}

impl PeerNode {
    /// Build a live entry from wire identity.
    #[must_use]
    pub fn from_info(info: &PeerInfo, load: u64) -> Self {
        Self {
            id: info.id.clone(),
            hostname: info.hostname.clone(),
            port: info.port,
            load,
            connected: true,
            timed_out: false,
        }
    }

    /// Wire identity of this entry.
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
        }
    }
}

/// What to do about a lost parent link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPlan {
    /// Try these targets in order; the grandparent (when recorded) comes
    /// first, then the candidate queue.
    Try(Vec<PeerInfo>),
    /// This node is the anchor child of the root: declare itself the new
    /// root.
    PromoteToRoot,
    /// Nothing to try; the partition is unrepairable.
    GiveUp,
}

/// This node's position in the tree plus the gossip table.
#[derive(Debug)]
pub struct ServerTopology {
    local: PeerInfo,
    parent: Option<PeerNode>,
    grandparent: Option<PeerNode>,
    sibling_root: Option<PeerNode>,
    children: Vec<PeerNode>,
    root_child: Option<String>,
    known: Vec<PeerNode>,
    reconnecting: bool,
}

impl ServerTopology {
    #[must_use]
    pub fn new(local: PeerInfo) -> Self {
        Self {
            local,
            parent: None,
            grandparent: None,
            sibling_root: None,
            children: Vec::new(),
            root_child: None,
            known: Vec::new(),
            reconnecting: false,
        }
    }

    #[must_use]
    pub const fn local(&self) -> &PeerInfo {
        &self.local
    }

    #[must_use]
    pub const fn parent(&self) -> Option<&PeerNode> {
        self.parent.as_ref()
    }

    #[must_use]
    pub const fn grandparent(&self) -> Option<&PeerNode> {
        self.grandparent.as_ref()
    }

    #[must_use]
    pub const fn sibling_root(&self) -> Option<&PeerNode> {
        self.sibling_root.as_ref()
    }

    #[must_use]
    pub fn children(&self) -> &[PeerNode] {
        &self.children
    }

    /// The anchor child's identity, if one is recorded.
    #[must_use]
    pub fn root_child(&self) -> Option<PeerInfo> {
        let id = self.root_child.as_deref()?;
        self.children
            .iter()
            .find(|c| c.id == id)
            .map(PeerNode::info)
    }

    /// Adopt a new parent. The old grandparent/sibling links are left for
    /// the caller to update from whatever the parent told it.
    pub fn set_parent(&mut self, info: &PeerInfo) {
        self.parent = Some(PeerNode::from_info(info, 0));
        self.upsert_known(info, 0);
    }

    /// Drop the parent link (lost or self-promoted). Returns the old parent.
    pub fn clear_parent(&mut self) -> Option<PeerNode> {
        self.parent.take()
    }

    pub fn set_grandparent(&mut self, info: Option<&PeerInfo>) {
        self.grandparent = info.map(|i| PeerNode::from_info(i, 0));
    }

    pub fn set_sibling_root(&mut self, info: Option<&PeerInfo>) {
        self.sibling_root = info.map(|i| PeerNode::from_info(i, 0));
    }

    /// This node may self-promote during partition repair: no grandparent
    /// recorded, and the recorded sibling anchor is this node itself.
    #[must_use]
    pub fn is_root_sibling(&self) -> bool {
        self.grandparent.is_none()
            && self
                .sibling_root
                .as_ref()
                .is_some_and(|s| s.id == self.local.id)
    }

    /// Record an authenticated child. The first child becomes the anchor
    /// "root child"; returns true when the anchor was (re)established.
    pub fn record_child(&mut self, info: &PeerInfo) -> bool {
        self.children.retain(|c| c.id != info.id);
        self.children.push(PeerNode::from_info(info, 0));
        self.upsert_known(info, 0);
        if self.root_child.is_none() {
            self.root_child = Some(info.id.clone());
            true
        } else {
            false
        }
    }

    /// Drop a child link. When the anchor left, the next child (if any) is
    /// promoted; `Some(new_anchor)` asks the caller to announce it.
    pub fn remove_child(&mut self, id: &str) -> Option<Option<PeerInfo>> {
        self.children.retain(|c| c.id != id);
        if self.root_child.as_deref() != Some(id) {
            return None;
        }
        let anchor = self.children.first().map(PeerNode::info);
        self.root_child = anchor.as_ref().map(|a| a.id.clone());
        Some(anchor)
    }

    /// Apply a gossip announce (or any other liveness evidence). Creates
    /// the entry when absent; overwriting load is idempotent, so the same
    /// announce arriving along two paths is harmless.
    pub fn upsert_known(&mut self, info: &PeerInfo, load: u64) {
        if info.id == self.local.id {
            return;
        }
        if let Some(entry) = self.known.iter_mut().find(|n| n.id == info.id) {
            entry.hostname = info.hostname.clone();
            entry.port = info.port;
            entry.load = load;
            entry.connected = true;
            entry.timed_out = false;
        } else {
            self.known.push(PeerNode::from_info(info, load));
        }
        if let Some(parent) = &mut self.parent {
            if parent.id == info.id {
                parent.load = load;
            }
        }
        if let Some(child) = self.children.iter_mut().find(|c| c.id == info.id) {
            child.load = load;
        }
    }

    /// Mark a server unreachable until gossip says otherwise.
    pub fn mark_timed_out(&mut self, id: &str) {
        if let Some(entry) = self.known.iter_mut().find(|n| n.id == id) {
            entry.timed_out = true;
            entry.connected = false;
        }
    }

    /// Servers known besides this one, in insertion order.
    #[must_use]
    pub fn known(&self) -> &[PeerNode] {
        &self.known
    }

    /// How many other servers this node currently knows of; the lock-reply
    /// countdown for a new registration.
    #[must_use]
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// First known, connected, non-timed-out server whose load undercuts
    /// ours by at least 2. Insertion order makes the choice deterministic.
    #[must_use]
    pub fn redirect_target(&self, local_load: u64) -> Option<PeerInfo> {
        self.known
            .iter()
            .find(|n| n.connected && !n.timed_out && n.load + 2 <= local_load)
            .map(PeerNode::info)
    }

    /// Decide how to repair a lost parent link.
    ///
    /// Grandparent first; then, unless this node is the root's anchor
    /// child, every other known server in table order (excluding the failed
    /// parent, this node's own children, and anything timed out). The
    /// anchor child of the root self-promotes instead of hunting for a new
    /// parent; a node with nothing to try gives up.
    #[must_use]
    pub fn reconnect_plan(&self, failed_parent: &str) -> ReconnectPlan {
        let mut targets = Vec::new();
        if let Some(grandparent) = &self.grandparent {
            targets.push(grandparent.info());
        }
        if self.is_root_sibling() {
            if targets.is_empty() {
                return ReconnectPlan::PromoteToRoot;
            }
        } else {
            for node in &self.known {
                let is_child = self.children.iter().any(|c| c.id == node.id);
                let already = targets.iter().any(|t| t.id == node.id);
                if node.timed_out || node.id == failed_parent || is_child || already {
                    continue;
                }
                targets.push(node.info());
            }
        }
        if targets.is_empty() {
            ReconnectPlan::GiveUp
        } else {
            ReconnectPlan::Try(targets)
        }
    }

    /// Serialize reconnection attempts: returns false when one is already
    /// running (the new loss event is ignored).
    pub fn begin_reconnect(&mut self) -> bool {
        if self.reconnecting {
            return false;
        }
        self.reconnecting = true;
        true
    }

    pub fn finish_reconnect(&mut self) {
        self.reconnecting = false;
    }

    #[must_use]
    pub const fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }
}
