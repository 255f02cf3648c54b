use std::collections::{HashMap, VecDeque};

use crate::{api::CommentId, Comment};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct MutationId(pub u64);

/// Lifecycle of one user mutation.
///
/// A mutation rejected before touching local state never leaves `Idle`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum MutationState {
    Idle,
    Applying,
    Committing,
    Committed,
    RolledBack,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum MutationKind {
    /// Attach this comment under its parent, or at the top level
    Add(Comment),
    /// Remove this comment and its replies
    Delete(CommentId),
    /// Make the current user's like of this comment be `liked`
    Like { comment_id: CommentId, liked: bool },
}

impl MutationKind {
    /// Comments whose remote operations get serialized with this one.
    ///
    /// A reply also waits for its parent, which may still be getting created.
    pub fn keys(&self) -> Vec<CommentId> {
        match self {
            MutationKind::Add(c) => std::iter::once(c.id).chain(c.parent_id).collect(),
            MutationKind::Delete(id) => vec![*id],
            MutationKind::Like { comment_id, .. } => vec![*comment_id],
        }
    }

    /// Applies the mutation to `tree`, doing nothing if it would not make sense there
    pub fn apply_to(&self, tree: &mut Vec<Comment>) {
        match self {
            MutationKind::Add(c) => {
                if Comment::find_in(tree, &c.id).is_some() {
                    // already confirmed
                    return;
                }
                match c.parent_id.and_then(|p| Comment::find_in_mut(tree, &p)) {
                    Some(parent) => {
                        parent.replies_count += 1;
                        parent.children.push(c.clone());
                    }
                    None => tree.push(c.clone()),
                }
            }
            MutationKind::Delete(id) => {
                let removed = match Comment::remove_from(tree, id) {
                    Some(r) => r,
                    None => return,
                };
                if let Some(parent) = removed.parent_id.and_then(|p| Comment::find_in_mut(tree, &p)) {
                    parent.replies_count = (parent.replies_count - 1).max(0);
                }
            }
            MutationKind::Like { comment_id, liked } => {
                if let Some(c) = Comment::find_in_mut(tree, comment_id) {
                    if c.is_liked != *liked {
                        c.is_liked = *liked;
                        let delta = if *liked { 1 } else { -1 };
                        c.likes_count = (c.likes_count + delta).max(0);
                    }
                }
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub kind: MutationKind,
    pub state: MutationState,
}

/// The confirmed comment tree of an entity, plus the mutations whose remote
/// call has not completed yet.
///
/// What gets displayed is always the confirmed tree with the pending mutations
/// replayed on top in order, so rolling back one of them is just forgetting it.
#[derive(Clone, Debug, Default)]
pub struct Overlay {
    base: Vec<Comment>,
    pending: Vec<PendingMutation>,
    view: Vec<Comment>,
    next_id: u64,
    revision: u64,
}

impl Overlay {
    pub fn new(base: Vec<Comment>) -> Overlay {
        Overlay {
            view: base.clone(),
            base,
            ..Overlay::default()
        }
    }

    pub fn view(&self) -> &[Comment] {
        &self.view
    }

    pub fn base(&self) -> &[Comment] {
        &self.base
    }

    pub fn pending(&self) -> &[PendingMutation] {
        &self.pending
    }

    /// Bumped every time a commit changes the confirmed tree
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Applies `kind` to the displayed tree and records it as committing
    pub fn apply(&mut self, kind: MutationKind) -> MutationId {
        let id = MutationId(self.next_id);
        self.next_id += 1;
        tracing::trace!(?id, state = ?MutationState::Applying, "applying mutation");
        kind.apply_to(&mut self.view);
        self.pending.push(PendingMutation {
            id,
            kind,
            state: MutationState::Committing,
        });
        id
    }

    /// Folds the confirmed outcome of mutation `id` into the confirmed tree
    pub fn commit(&mut self, id: MutationId, confirmed: MutationKind) -> MutationState {
        if self.take_pending(id).is_none() {
            return MutationState::Idle;
        }
        confirmed.apply_to(&mut self.base);
        self.revision += 1;
        self.rederive();
        MutationState::Committed
    }

    /// Forgets mutation `id`, restoring the display as if it never happened
    pub fn rollback(&mut self, id: MutationId) -> MutationState {
        if self.take_pending(id).is_none() {
            return MutationState::Idle;
        }
        self.rederive();
        MutationState::RolledBack
    }

    /// Replaces the confirmed tree with a fresh server snapshot
    pub fn rebase(&mut self, base: Vec<Comment>) {
        self.base = base;
        self.rederive();
    }

    fn take_pending(&mut self, id: MutationId) -> Option<PendingMutation> {
        let pos = self.pending.iter().position(|p| p.id == id)?;
        Some(self.pending.remove(pos))
    }

    fn rederive(&mut self) {
        let mut view = self.base.clone();
        for p in &self.pending {
            p.kind.apply_to(&mut view);
        }
        self.view = view;
    }
}

/// Order in which mutations may talk to the backend, per comment.
///
/// Tickets are taken synchronously when a mutation gets applied locally, so
/// the remote calls for a comment happen in the order the user made them.
#[derive(Debug, Default)]
pub struct TurnQueue {
    queues: parking_lot::Mutex<HashMap<CommentId, VecDeque<MutationId>>>,
    notify: tokio::sync::Notify,
}

impl TurnQueue {
    pub fn enqueue(&self, key: CommentId, id: MutationId) {
        self.queues.lock().entry(key).or_default().push_back(id);
    }

    fn is_turn(&self, key: &CommentId, id: MutationId) -> bool {
        self.queues
            .lock()
            .get(key)
            .and_then(|q| q.front())
            .map(|front| *front == id)
            .unwrap_or(true)
    }

    /// Waits until all mutations enqueued before `id` on `key` have finished
    pub async fn wait_turn(&self, key: CommentId, id: MutationId) {
        loop {
            // registered before checking, so a finish in between is not missed
            let notified = self.notify.notified();
            if self.is_turn(&key, id) {
                return;
            }
            notified.await;
        }
    }

    pub fn finish(&self, key: CommentId, id: MutationId) {
        {
            let mut queues = self.queues.lock();
            if let Some(q) = queues.get_mut(&key) {
                q.retain(|m| *m != id);
                if q.is_empty() {
                    queues.remove(&key);
                }
            }
        }
        self.notify.notify_waiters();
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}
