//! Bulk operations over a render tree.
//!
//! Each iteration helper comes in a plain form and a `_blocked` form taking
//! an [`OperationBlocker`], which can suppress items it has already seen.

use std::hash::Hash;

use ahash::AHashSet;

use crate::render_mesh::RenderPriority;
use crate::render_tree::{ContextId, ContextNode, MeshNode, RenderTree};

/// Decides whether an operation runs on an item.
pub trait OperationBlocker<K> {
    fn should_run(&mut self, key: &K) -> bool;
}

/// Runs the operation on every item.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOperationBlock;

impl<K> OperationBlocker<K> for NoOperationBlock {
    fn should_run(&mut self, _: &K) -> bool {
        true
    }
}

/// Runs the operation at most once per key.
#[derive(Debug)]
pub struct OnceOperationBlock<K> {
    seen: AHashSet<K>,
}

impl<K: Hash + Eq> Default for OnceOperationBlock<K> {
    fn default() -> Self {
        Self { seen: AHashSet::new() }
    }
}

impl<K: Hash + Eq> OnceOperationBlock<K> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: Hash + Eq + Clone> OperationBlocker<K> for OnceOperationBlock<K> {
    fn should_run(&mut self, key: &K) -> bool {
        self.seen.insert(key.clone())
    }
}

pub fn for_each_context(tree: &mut RenderTree<'_>, f: impl FnMut(ContextId, &mut ContextNode)) {
    for_each_context_blocked(tree, &mut NoOperationBlock, f);
}

pub fn for_each_context_blocked(
    tree: &mut RenderTree<'_>,
    blocker: &mut impl OperationBlocker<ContextId>,
    mut f: impl FnMut(ContextId, &mut ContextNode),
) {
    let order = tree.order().to_vec();
    for id in order {
        if blocker.should_run(&id) {
            f(id, tree.context_mut(id));
        }
    }
}

pub fn for_each_context_reverse(tree: &mut RenderTree<'_>, f: impl FnMut(ContextId, &mut ContextNode)) {
    for_each_context_reverse_blocked(tree, &mut NoOperationBlock, f);
}

pub fn for_each_context_reverse_blocked(
    tree: &mut RenderTree<'_>,
    blocker: &mut impl OperationBlocker<ContextId>,
    mut f: impl FnMut(ContextId, &mut ContextNode),
) {
    let order = tree.order().to_vec();
    for id in order.into_iter().rev() {
        if blocker.should_run(&id) {
            f(id, tree.context_mut(id));
        }
    }
}

pub fn for_each_mesh_node(context: &mut ContextNode, f: impl FnMut(&mut MeshNode)) {
    for_each_mesh_node_blocked(context, &mut NoOperationBlock, f);
}

pub fn for_each_mesh_node_blocked(
    context: &mut ContextNode,
    blocker: &mut impl OperationBlocker<RenderPriority>,
    mut f: impl FnMut(&mut MeshNode),
) {
    for node in context.mesh_nodes_mut() {
        if blocker.should_run(&node.priority) {
            f(node);
        }
    }
}

pub fn for_each_mesh_node_reverse(context: &mut ContextNode, f: impl FnMut(&mut MeshNode)) {
    for_each_mesh_node_reverse_blocked(context, &mut NoOperationBlock, f);
}

pub fn for_each_mesh_node_reverse_blocked(
    context: &mut ContextNode,
    blocker: &mut impl OperationBlocker<RenderPriority>,
    mut f: impl FnMut(&mut MeshNode),
) {
    for node in context.mesh_nodes_mut().rev() {
        if blocker.should_run(&node.priority) {
            f(node);
        }
    }
}

/// Assigns sequential context-local ids to all meshes in priority order.
pub fn number_meshes(context: &mut ContextNode) {
    let mut next = 0;
    for_each_mesh_node(context, |node| {
        for mesh in &mut node.meshes {
            mesh.context_local_id = next;
            next += 1;
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::camera::Camera;
    use crate::render_mesh::RenderMesh;
    use crate::render_tree::TreePersistentData;
    use crate::render_view::RenderView;

    fn view() -> RenderView {
        RenderView::new(Camera::default(), 16, 16)
    }

    #[test]
    fn test_context_iteration_orders() {
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        let a = tree.create_context(view(), None);
        let b = tree.create_context(view(), None);
        let c = tree.create_context(view(), Some(a));

        let mut forward = Vec::new();
        for_each_context(&mut tree, |id, _| forward.push(id));
        assert_eq!(forward, vec![a, c, b]);

        let mut backward = Vec::new();
        for_each_context_reverse(&mut tree, |id, _| backward.push(id));
        assert_eq!(backward, vec![b, c, a]);
    }

    #[test]
    fn test_once_blocker_suppresses_repeats() {
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        tree.create_context(view(), None);
        tree.create_context(view(), None);

        let mut blocker = OnceOperationBlock::new();
        let mut visits = 0;
        for_each_context_blocked(&mut tree, &mut blocker, |_, _| visits += 1);
        for_each_context_reverse_blocked(&mut tree, &mut blocker, |_, _| visits += 1);
        assert_eq!(visits, 2);
    }

    #[test]
    fn test_number_meshes_spans_priorities() {
        let mut persistent = TreePersistentData::new();
        let mut tree = RenderTree::new(&mut persistent);
        let id = tree.create_context(view(), None);
        let context = tree.context_mut(id);
        context.add_render_mesh(Arc::new(RenderMesh::default()), RenderPriority::ALPHA);
        context.add_render_mesh(Arc::new(RenderMesh::default()), RenderPriority::OBJECT);
        context.add_render_mesh(Arc::new(RenderMesh::default()), RenderPriority::OBJECT);

        number_meshes(context);

        let ids: Vec<_> = context
            .mesh_nodes()
            .flat_map(|node| node.meshes.iter().map(|m| m.context_local_id))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let mut reversed = Vec::new();
        for_each_mesh_node_reverse(context, |node| reversed.push(node.priority));
        assert_eq!(reversed, vec![RenderPriority::ALPHA, RenderPriority::OBJECT]);
    }
}
