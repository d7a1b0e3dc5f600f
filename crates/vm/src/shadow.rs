//! Copy-on-write shadow chains.
//!
//! A private mapping starts out pointing at the object it maps with `SHADOW` set. Its
//! first fault interposes a shadow object between the map and the original, so writes
//! land in pages private to the map. When the last user of an intermediate object goes
//! away, the chain is collapsed: the object's pages move into its only child and the
//! child is linked to the grandparent.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use crate::object::{ObjectKind, VmObject};
use crate::AnonPager;

impl VmObject {
    /// Records a private mapping that will shadow this object on its first fault.
    pub(crate) fn register_demand(&self) {
        self.state.lock().demand += 1;
    }

    /// Drops a pending shadow request, collapsing the chain if this was its last use.
    pub(crate) fn unregister_demand(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            assert!(st.demand > 0, "unbalanced shadow demand on {:?}", self.id());
            st.demand -= 1;
        }
        self.simplify();
    }

    /// Resolves a pending shadow request for one mapping of this object.
    ///
    /// Returns the object the mapping should use from now on: this object itself if the
    /// mapping is its only user, otherwise a new shadow over it. The caller holds the
    /// map's lock and swaps the map's object.
    pub(crate) fn demand_shadow(self: &Arc<Self>) -> Arc<VmObject> {
        let mut st = self.state.lock();
        assert!(st.demand > 0, "shadow demand on {:?} without a pending map", self.id());

        let has_children = st.children.iter().any(|c| c.strong_count() > 0);
        if self.kind() != ObjectKind::Paged && st.demand == 1 && !has_children && st.live_maps() <= 1 {
            st.demand = 0;
            return self.clone();
        }

        st.demand -= 1;
        let shadow = VmObject::with_kind(
            ObjectKind::Shadow,
            st.size,
            Arc::new(AnonPager),
            Some(self.clone()),
            self.phys.clone(),
            self.pghash.clone(),
        );
        st.children.retain(|c| c.strong_count() > 0);
        st.children.push(Arc::downgrade(&shadow));
        log::debug!("shadow: {:?} over {:?}", shadow.id(), self.id());
        shadow
    }

    /// Collapses this object into its only child if nothing else uses it.
    ///
    /// The caller's reference and the child's parent link must be the only strong
    /// references left.
    pub(crate) fn simplify(self: &Arc<Self>) {
        if self.kind() == ObjectKind::Paged {
            return;
        }
        let child = {
            let st = self.state.lock();
            if st.demand > 0 || st.live_maps() > 0 {
                return;
            }
            let mut live: Vec<Arc<VmObject>> = st.children.iter().filter_map(|c| c.upgrade()).collect();
            if live.len() != 1 {
                return;
            }
            match live.pop() {
                Some(child) => child,
                None => return,
            }
        };
        if Arc::strong_count(self) > 2 {
            return;
        }

        let (dropped, old_parent) = {
            let mut cst = child.state.lock();
            let mut pst = self.state.lock();
            let linked = cst.shadow.as_ref().is_some_and(|p| Arc::ptr_eq(p, self));
            if !linked || pst.demand > 0 || pst.live_maps() > 0 {
                return;
            }

            let (moved, dropped) = child.migrate_locked(&mut cst, self, &mut pst);
            let grandparent = pst.shadow.take();
            pst.children.clear();
            if let Some(grandparent) = &grandparent {
                let me = Arc::as_ptr(self);
                for link in grandparent.state.lock().children.iter_mut() {
                    if link.as_ptr() == me {
                        *link = Arc::downgrade(&child);
                    }
                }
            }
            log::debug!(
                "shadow: collapsed {:?} into {:?} ({} pages moved, {} dropped)",
                self.id(),
                child.id(),
                moved,
                dropped.len()
            );
            (dropped, mem::replace(&mut cst.shadow, grandparent))
        };

        child.release_dropped(dropped);
        drop(old_parent);
    }
}
