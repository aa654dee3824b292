//! # Scene Graph
//!
//! Arena-indexed node tree with weak upward references.
//!
//! Nodes live in slots addressed by index + generation, so a stale
//! [`NodeId`] held across a removal resolves to nothing instead of to a
//! recycled stranger. Parents own children; the upward link is just an id.
//!
//! `attach` reparents by recomposing the node's world transform into the
//! new parent's space, so an attach never visibly moves the node.

use atrium_shared::Transform;

/// Slot address: index + generation for safe reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Index into the slot array.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

/// A scene node: local transform, activation, collision layer.
#[derive(Clone, Debug)]
pub struct Node {
    /// Debug-friendly node name.
    pub name: String,
    /// Transform relative to the parent.
    pub local: Transform,
    /// Inactive nodes (and their subtrees) are skipped by queries.
    pub active: bool,
    /// Collision layer bits (environment / prop / tool).
    pub layer: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    /// Creates a node with the given name and local transform.
    #[must_use]
    pub fn new(name: impl Into<String>, local: Transform) -> Self {
        Self {
            name: name.into(),
            local,
            active: true,
            layer: 0,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Parent id, if attached.
    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child ids in attach order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

enum Slot {
    Free { generation: u32 },
    Occupied { generation: u32, node: Node },
}

/// The arena of scene nodes.
#[derive(Default)]
pub struct SceneGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: Vec<NodeId>,
}

impl SceneGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    /// True when no nodes are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Root node ids in insertion order.
    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Inserts a node under `parent` (or as a root).
    pub fn insert(&mut self, mut node: Node, parent: Option<NodeId>) -> NodeId {
        node.parent = parent.filter(|p| self.get(*p).is_some());
        let resolved_parent = node.parent;
        let id = match self.free.pop() {
            Some(index) => {
                let generation = match &self.slots[index as usize] {
                    Slot::Free { generation } => *generation,
                    Slot::Occupied { .. } => unreachable!("free list held an occupied slot"),
                };
                self.slots[index as usize] = Slot::Occupied { generation, node };
                NodeId { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied { generation: 0, node });
                NodeId { index, generation: 0 }
            }
        };
        match resolved_parent {
            Some(parent_id) => {
                if let Some(parent_node) = self.get_mut(parent_id) {
                    parent_node.children.push(id);
                }
            }
            None => self.roots.push(id),
        }
        id
    }

    /// Resolves a node id, or None if the id is stale.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied { generation, node }) if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    /// Mutable resolve.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied { generation, node }) if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    /// World transform of a node: the product of every ancestor's local.
    #[must_use]
    pub fn world_transform(&self, id: NodeId) -> Option<Transform> {
        let node = self.get(id)?;
        let mut world = node.local;
        let mut cursor = node.parent;
        while let Some(pid) = cursor {
            let parent = self.get(pid)?;
            world = parent.local.mul(world);
            cursor = parent.parent;
        }
        Some(world)
    }

    /// True when the node and every ancestor are active.
    #[must_use]
    pub fn is_effectively_active(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(nid) = cursor {
            match self.get(nid) {
                Some(node) if node.active => cursor = node.parent,
                _ => return false,
            }
        }
        true
    }

    /// Sets the active flag on one node (the subtree follows implicitly).
    pub fn set_active(&mut self, id: NodeId, active: bool) {
        if let Some(node) = self.get_mut(id) {
            node.active = active;
        }
    }

    /// Reparents `id` under `new_parent` (or to root when None), recomposing
    /// the world transform into the new local transform so the node does not
    /// move.
    ///
    /// Attaching a node beneath itself is refused.
    pub fn attach(&mut self, id: NodeId, new_parent: Option<NodeId>) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        if let Some(p) = new_parent {
            if self.get(p).is_none() || p == id || self.is_descendant(p, id) {
                return false;
            }
        }
        let Some(world) = self.world_transform(id) else {
            return false;
        };
        let new_local = match new_parent {
            Some(p) => match self.world_transform(p) {
                Some(parent_world) => parent_world.inverse().mul(world),
                None => return false,
            },
            None => world,
        };
        self.unlink(id);
        if let Some(node) = self.get_mut(id) {
            node.local = new_local;
            node.parent = new_parent;
        }
        match new_parent {
            Some(p) => {
                if let Some(parent_node) = self.get_mut(p) {
                    parent_node.children.push(id);
                }
            }
            None => self.roots.push(id),
        }
        true
    }

    /// Removes a node and its whole subtree. Returns removed node count.
    pub fn remove_subtree(&mut self, id: NodeId) -> usize {
        if self.get(id).is_none() {
            return 0;
        }
        self.unlink(id);
        let mut stack = vec![id];
        let mut removed = 0;
        while let Some(nid) = stack.pop() {
            if let Some(node) = self.get(nid) {
                stack.extend(node.children.iter().copied());
                let index = nid.index as usize;
                self.slots[index] = Slot::Free {
                    generation: nid.generation.wrapping_add(1),
                };
                self.free.push(nid.index);
                removed += 1;
            }
        }
        removed
    }

    /// Depth-first walk of a subtree, active nodes only.
    pub fn walk_active(&self, id: NodeId, visit: &mut impl FnMut(NodeId, &Node)) {
        let Some(node) = self.get(id) else { return };
        if !node.active {
            return;
        }
        visit(id, node);
        for child in node.children.clone() {
            self.walk_active(child, visit);
        }
    }

    fn is_descendant(&self, candidate: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = self.get(candidate).and_then(Node::parent);
        while let Some(nid) = cursor {
            if nid == ancestor {
                return true;
            }
            cursor = self.get(nid).and_then(Node::parent);
        }
        false
    }

    fn unlink(&mut self, id: NodeId) {
        let parent = self.get(id).and_then(Node::parent);
        match parent {
            Some(pid) => {
                if let Some(parent_node) = self.get_mut(pid) {
                    parent_node.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_shared::{Quat, Vec3};

    fn at(p: Vec3) -> Transform {
        Transform::from_position(p)
    }

    #[test]
    fn test_insert_and_world_transform() {
        let mut scene = SceneGraph::new();
        let root = scene.insert(Node::new("root", at(Vec3::new(1.0, 0.0, 0.0))), None);
        let child = scene.insert(Node::new("child", at(Vec3::new(0.0, 2.0, 0.0))), Some(root));
        let world = scene.world_transform(child).unwrap();
        assert!((world.position - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_attach_preserves_world_pose() {
        let mut scene = SceneGraph::new();
        let a = scene.insert(
            Node::new(
                "a",
                Transform::new(Vec3::new(5.0, 0.0, 0.0), Quat::from_yaw(1.2), Vec3::ONE),
            ),
            None,
        );
        let b = scene.insert(Node::new("b", at(Vec3::new(0.0, 0.0, 3.0))), None);
        let before = scene.world_transform(b).unwrap();
        assert!(scene.attach(b, Some(a)));
        let after = scene.world_transform(b).unwrap();
        assert!((after.position - before.position).length() < 1e-4);
        assert!(after.rotation.dot(before.rotation).abs() > 0.9999);
    }

    #[test]
    fn test_attach_rejects_cycles() {
        let mut scene = SceneGraph::new();
        let a = scene.insert(Node::new("a", Transform::IDENTITY), None);
        let b = scene.insert(Node::new("b", Transform::IDENTITY), Some(a));
        assert!(!scene.attach(a, Some(b)));
        assert!(!scene.attach(a, Some(a)));
    }

    #[test]
    fn test_remove_subtree_frees_ids() {
        let mut scene = SceneGraph::new();
        let a = scene.insert(Node::new("a", Transform::IDENTITY), None);
        let b = scene.insert(Node::new("b", Transform::IDENTITY), Some(a));
        let c = scene.insert(Node::new("c", Transform::IDENTITY), Some(b));
        assert_eq!(scene.remove_subtree(a), 3);
        assert!(scene.get(a).is_none());
        assert!(scene.get(b).is_none());
        assert!(scene.get(c).is_none());
        assert!(scene.is_empty());

        // Recycled slot gets a new generation; stale ids stay dead.
        let d = scene.insert(Node::new("d", Transform::IDENTITY), None);
        assert!(scene.get(d).is_some());
        assert!(scene.get(a).is_none());
    }

    #[test]
    fn test_effective_activity_follows_ancestors() {
        let mut scene = SceneGraph::new();
        let a = scene.insert(Node::new("a", Transform::IDENTITY), None);
        let b = scene.insert(Node::new("b", Transform::IDENTITY), Some(a));
        assert!(scene.is_effectively_active(b));
        scene.set_active(a, false);
        assert!(!scene.is_effectively_active(b));
        assert!(scene.get(b).unwrap().active);
    }

    #[test]
    fn test_walk_active_skips_inactive_subtrees() {
        let mut scene = SceneGraph::new();
        let a = scene.insert(Node::new("a", Transform::IDENTITY), None);
        let b = scene.insert(Node::new("b", Transform::IDENTITY), Some(a));
        let _c = scene.insert(Node::new("c", Transform::IDENTITY), Some(b));
        scene.set_active(b, false);
        let mut seen = Vec::new();
        scene.walk_active(a, &mut |_, node| seen.push(node.name.clone()));
        assert_eq!(seen, vec!["a".to_owned()]);
    }
}
