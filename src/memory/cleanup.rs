//! Cleanup registry: callbacks run once, most recent first, when a pool is
//! cleared or destroyed.
//!
//! Nodes live in the pool's own memory. Unlinked nodes go to a free-list and
//! are reused by later registrations instead of bumping fresh memory.
//! Registrations made while the pool is being torn down are kept aside on the
//! heap until the teardown is over.

use super::block::ALIGN;
use std::alloc::Layout;
use std::ptr::NonNull;

/// A plain cleanup callback, invoked with the `data` pointer it was registered with.
///
/// Registrations made with a `CleanupFn` can be run early or removed by
/// passing the same `(data, callback)` pair again.
pub type CleanupFn = fn(*mut u8);

pub(crate) enum Action {
    Fn(CleanupFn),
    Closure(Box<dyn FnOnce() + Send>),
    /// Memory obtained from the general allocator for an oversized request.
    FreeOversized(Layout),
}

impl Action {
    fn invoke(self, data: *mut u8) {
        match self {
            Action::Fn(f) => f(data),
            Action::Closure(f) => f(),
            // Safety: data was returned by std::alloc::alloc with this layout
            // and this action is its only owner.
            Action::FreeOversized(layout) => unsafe { std::alloc::dealloc(data, layout) },
        }
    }

    /// Drop without running user code. Oversized memory is still returned.
    fn discard(self, data: *mut u8) {
        match self {
            Action::FreeOversized(_) => self.invoke(data),
            Action::Fn(_) | Action::Closure(_) => drop(self),
        }
    }

    fn matches(&self, callback: CleanupFn) -> bool {
        matches!(self, Action::Fn(f) if std::ptr::fn_addr_eq(*f, callback))
    }
}

pub(crate) struct CleanupNode {
    next: Option<NonNull<CleanupNode>>,
    data: *mut u8,
    action: Option<Action>,
}

/// Bytes a node takes when bump-allocated from a pool.
pub(crate) const CLEANUP_NODE_SIZE: usize = std::mem::size_of::<CleanupNode>();

const _: () = assert!(std::mem::align_of::<CleanupNode>() <= ALIGN);

/// Active chain, free-list and deferred registrations of one pool.
pub(crate) struct CleanupChain {
    active: Option<NonNull<CleanupNode>>,
    free: Option<NonNull<CleanupNode>>,
    len: usize,
    /// Oldest first.
    deferred: Vec<(*mut u8, Action)>,
}

/// Nodes unlinked from the active chain by [`CleanupChain::detach_all`].
#[derive(Default)]
pub(crate) struct Detached {
    head: Option<NonNull<CleanupNode>>,
    /// First node whose action has not been taken yet.
    cursor: Option<NonNull<CleanupNode>>,
}

/// Registrations taken out of a chain by [`CleanupChain::take_deferred`].
///
/// Entries still held when this is dropped are discarded: closures are
/// dropped unrun and oversized memory is freed.
pub(crate) struct Deferred(Vec<(*mut u8, Action)>);

impl CleanupChain {
    pub(crate) const fn new() -> Self {
        Self {
            active: None,
            free: None,
            len: 0,
            deferred: Vec::new(),
        }
    }

    /// Registered cleanups that have not run yet, deferred ones included.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len + self.deferred.len()
    }

    /// Pop a recycled node, if any.
    pub(crate) fn take_free(&mut self) -> Option<NonNull<CleanupNode>> {
        let node = self.free?;
        // Safety: free-list nodes are live pool memory owned by this chain.
        self.free = unsafe { (*node.as_ptr()).next };
        Some(node)
    }

    /// Initialise `node` and link it at the head of the active chain.
    ///
    /// # Safety
    ///
    /// `node` must be aligned, `CLEANUP_NODE_SIZE` bytes of pool memory that is
    /// either fresh or came from [`take_free`](Self::take_free).
    pub(crate) unsafe fn push(&mut self, node: NonNull<CleanupNode>, data: *mut u8, action: Action) {
        // Safety: per contract; recycled nodes hold no action, so nothing is
        // leaked by overwriting.
        unsafe {
            node.as_ptr().write(CleanupNode {
                next: self.active,
                data,
                action: Some(action),
            });
        }
        self.active = Some(node);
        self.len += 1;
    }

    /// Hold a registration off the active chain until [`take_deferred`](Self::take_deferred).
    pub(crate) fn defer(&mut self, data: *mut u8, action: Action) {
        self.deferred.push((data, action));
    }

    pub(crate) fn take_deferred(&mut self) -> Deferred {
        Deferred(std::mem::take(&mut self.deferred))
    }

    /// Unlink the first node registered with exactly `(data, callback)`.
    pub(crate) fn unlink(&mut self, data: *mut u8, callback: CleanupFn) -> Option<NonNull<CleanupNode>> {
        let mut prev: Option<NonNull<CleanupNode>> = None;
        let mut cur = self.active;
        while let Some(node) = cur {
            // Safety: active nodes are live pool memory owned by this chain.
            let n = unsafe { &mut *node.as_ptr() };
            let hit = n.data == data && n.action.as_ref().is_some_and(|a| a.matches(callback));
            if hit {
                match prev {
                    // Safety: prev is an active node distinct from `node`.
                    Some(p) => unsafe { (*p.as_ptr()).next = n.next },
                    None => self.active = n.next,
                }
                n.next = None;
                self.len -= 1;
                return Some(node);
            }
            prev = cur;
            cur = n.next;
        }
        None
    }

    /// Remove the most recent deferred registration of `(data, callback)`.
    pub(crate) fn unlink_deferred(&mut self, data: *mut u8, callback: CleanupFn) -> Option<Action> {
        let pos = self
            .deferred
            .iter()
            .rposition(|(d, action)| *d == data && action.matches(callback))?;
        Some(self.deferred.remove(pos).1)
    }

    /// Return an unlinked node to the free-list, dropping any action it still holds.
    ///
    /// # Safety
    ///
    /// `node` must have been unlinked from this chain and not be on the free-list.
    pub(crate) unsafe fn recycle(&mut self, node: NonNull<CleanupNode>) {
        // Safety: per contract the node is exclusively ours.
        let n = unsafe { &mut *node.as_ptr() };
        drop(n.action.take());
        n.data = std::ptr::null_mut();
        n.next = self.free;
        self.free = Some(node);
    }

    /// Unlink the whole active chain, most recent first.
    pub(crate) fn detach_all(&mut self) -> Detached {
        self.len = 0;
        let head = self.active.take();
        Detached { head, cursor: head }
    }

    /// Take back nodes handed out by [`detach_all`](Self::detach_all).
    ///
    /// Nodes that ran go to the free-list. Nodes that never ran, because a
    /// cleanup before them unwound, are linked behind the current active
    /// chain so they run at the next teardown.
    ///
    /// # Safety
    ///
    /// `detached` must come from this chain and its nodes must still be mapped.
    pub(crate) unsafe fn reclaim(&mut self, detached: Detached) {
        let mut cur = detached.head;
        while cur != detached.cursor {
            let Some(node) = cur else { break };
            // Safety: detached nodes are still live pool memory.
            cur = unsafe { (*node.as_ptr()).next };
            // Safety: each run node is recycled exactly once.
            unsafe { self.recycle(node) };
        }

        let Some(rest) = detached.cursor else {
            return;
        };
        let mut unrun = 0;
        let mut cur = Some(rest);
        while let Some(node) = cur {
            unrun += 1;
            // Safety: as above.
            cur = unsafe { (*node.as_ptr()).next };
        }
        let mut tail = self.active;
        // Safety: active nodes are live pool memory owned by this chain.
        while let Some(next) = tail.and_then(|t| unsafe { (*t.as_ptr()).next }) {
            tail = Some(next);
        }
        match tail {
            // Safety: as above.
            Some(t) => unsafe { (*t.as_ptr()).next = Some(rest) },
            None => self.active = Some(rest),
        }
        self.len += unrun;
    }

    /// Forget the free-list without touching its nodes. Used when the memory
    /// backing them is rewound.
    pub(crate) fn forget_free(&mut self) {
        self.free = None;
    }
}

impl Detached {
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Invoke every action in chain order. Nodes stay linked for
    /// [`CleanupChain::reclaim`].
    ///
    /// # Safety
    ///
    /// The nodes must stay mapped for the duration of the call.
    pub(crate) unsafe fn run(&mut self) {
        while let Some(node) = self.cursor {
            // Safety: per contract; the action is taken out before it runs so a
            // re-entrant caller never observes it twice.
            let (next, data, action) = unsafe {
                let n = &mut *node.as_ptr();
                (n.next, n.data, n.action.take())
            };
            self.cursor = next;
            if let Some(action) = action {
                action.invoke(data);
            }
        }
    }
}

impl Deferred {
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Invoke the entries, most recent first.
    pub(crate) fn run(&mut self) {
        while let Some((data, action)) = self.0.pop() {
            action.invoke(data);
        }
    }

    /// Oldest first, leaving nothing to discard.
    pub(crate) fn into_entries(mut self) -> Vec<(*mut u8, Action)> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        for (data, action) in self.0.drain(..) {
            action.discard(data);
        }
    }
}

/// Take the data pointer and action out of a node unlinked by
/// [`CleanupChain::unlink`], leaving it ready for recycling.
///
/// # Safety
///
/// `node` must be unlinked, live, and not yet recycled.
pub(crate) unsafe fn take_action(node: NonNull<CleanupNode>) -> (*mut u8, Option<Action>) {
    // Safety: per contract.
    let n = unsafe { &mut *node.as_ptr() };
    (n.data, n.action.take())
}

/// Run the action of a node unlinked by [`CleanupChain::unlink`].
///
/// # Safety
///
/// `node` must be unlinked, live, and not yet recycled.
pub(crate) unsafe fn invoke_unlinked(node: NonNull<CleanupNode>) {
    // Safety: per contract.
    let (data, action) = unsafe { take_action(node) };
    if let Some(action) = action {
        action.invoke(data);
    }
}

/// Run an action taken out of the deferred list.
pub(crate) fn invoke_action(data: *mut u8, action: Action) {
    action.invoke(data);
}
