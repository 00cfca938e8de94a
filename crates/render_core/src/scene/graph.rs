//! Node arena
//!
//! Nodes live in a `SlotMap` and link to each other by [`NodeId`]; the scene
//! owns every node and there is exactly one root. Construction calls refuse
//! anything that would turn the tree into a cyclic graph.

use slotmap::{new_key_type, SlotMap};

use super::{Camera, Light, SceneError};
use crate::foundation::math::{Mat4, Transform, Vec4};
use crate::render::mesh::MeshHandle;

new_key_type! {
    /// Node in a [`Scene`]
    pub struct NodeId;
}

/// Ambient color of a new scene
pub const DEFAULT_AMBIENT: [f32; 4] = [0.2, 0.2, 0.2, 1.0];

/// What a node contributes when compiled
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Attachment {
    /// Draws every primitive of the mesh
    Mesh(MeshHandle),
    /// Adds a camera
    Camera(Camera),
    /// Adds a light
    Light(Light),
}

#[derive(Debug, Clone)]
pub(super) struct Node {
    pub(super) parent: Option<NodeId>,
    pub(super) children: Vec<NodeId>,
    pub(super) local: Mat4,
    pub(super) attachment: Option<Attachment>,
    pub(super) visible: bool,
}

impl Node {
    fn new(parent: Option<NodeId>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            local: Mat4::identity(),
            attachment: None,
            visible: true,
        }
    }
}

/// Tree of nodes with transforms and attachments
#[derive(Debug, Clone)]
pub struct Scene {
    pub(super) nodes: SlotMap<NodeId, Node>,
    root: NodeId,
    ambient: Vec4,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// Scene holding only a root node
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node::new(None));
        Self {
            nodes,
            root,
            ambient: Vec4::from(DEFAULT_AMBIENT),
        }
    }

    /// Root node
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root cannot be removed
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `node` is part of this scene
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    /// Ambient light color
    pub const fn ambient(&self) -> Vec4 {
        self.ambient
    }

    /// Set the ambient light color
    pub fn set_ambient(&mut self, ambient: Vec4) {
        self.ambient = ambient;
    }

    fn node(&self, node: NodeId) -> Result<&Node, SceneError> {
        self.nodes.get(node).ok_or(SceneError::UnknownNode)
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut Node, SceneError> {
        self.nodes.get_mut(node).ok_or(SceneError::UnknownNode)
    }

    /// Add an empty node under `parent`
    pub fn add_node(&mut self, parent: NodeId) -> Result<NodeId, SceneError> {
        self.node(parent)?;
        let node = self.nodes.insert(Node::new(Some(parent)));
        self.node_mut(parent)?.children.push(node);
        Ok(node)
    }

    /// Parent of `node`; `None` for the root
    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>, SceneError> {
        self.node(node).map(|n| n.parent)
    }

    /// Children in insertion order
    pub fn children(&self, node: NodeId) -> Result<&[NodeId], SceneError> {
        self.node(node).map(|n| n.children.as_slice())
    }

    /// Local transform relative to the parent
    pub fn local_transform(&self, node: NodeId) -> Result<Mat4, SceneError> {
        self.node(node).map(|n| n.local)
    }

    /// Replace the local transform
    pub fn set_local_transform(&mut self, node: NodeId, local: Mat4) -> Result<(), SceneError> {
        self.node_mut(node)?.local = local;
        Ok(())
    }

    /// Replace the local transform from translation, rotation and scale
    pub fn set_transform(&mut self, node: NodeId, transform: &Transform) -> Result<(), SceneError> {
        self.set_local_transform(node, transform.to_matrix())
    }

    /// Attach a mesh, camera or light, replacing any previous attachment
    pub fn attach(&mut self, node: NodeId, attachment: Attachment) -> Result<(), SceneError> {
        self.node_mut(node)?.attachment = Some(attachment);
        Ok(())
    }

    /// Remove and return the attachment
    pub fn detach(&mut self, node: NodeId) -> Result<Option<Attachment>, SceneError> {
        Ok(self.node_mut(node)?.attachment.take())
    }

    /// Current attachment
    pub fn attachment(&self, node: NodeId) -> Result<Option<&Attachment>, SceneError> {
        self.node(node).map(|n| n.attachment.as_ref())
    }

    /// Show or hide a node and its subtree
    pub fn set_visible(&mut self, node: NodeId, visible: bool) -> Result<(), SceneError> {
        self.node_mut(node)?.visible = visible;
        Ok(())
    }

    /// Whether `ancestor` is `node` or lies on its parent chain
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> Result<bool, SceneError> {
        let mut current = Some(node);
        let mut steps = 0;
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            steps += 1;
            if steps > self.nodes.len() {
                return Err(SceneError::CycleDetected);
            }
            current = self.node(id)?.parent;
        }
        Ok(false)
    }

    /// Move `node` (and its subtree) under `new_parent`
    pub fn reparent(&mut self, node: NodeId, new_parent: NodeId) -> Result<(), SceneError> {
        if node == self.root {
            return Err(SceneError::CannotMoveRoot);
        }
        self.node(node)?;
        if self.is_ancestor(node, new_parent)? {
            return Err(SceneError::WouldCreateCycle);
        }

        if let Some(old_parent) = self.node(node)?.parent {
            self.node_mut(old_parent)?.children.retain(|child| *child != node);
        }
        self.node_mut(new_parent)?.children.push(node);
        self.node_mut(node)?.parent = Some(new_parent);
        Ok(())
    }

    /// Remove `node` and its whole subtree
    ///
    /// Returns the number of nodes removed.
    pub fn remove_node(&mut self, node: NodeId) -> Result<usize, SceneError> {
        if node == self.root {
            return Err(SceneError::CannotMoveRoot);
        }
        if let Some(parent) = self.node(node)?.parent {
            self.node_mut(parent)?.children.retain(|child| *child != node);
        }

        let mut removed = 0;
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(removed_node) = self.nodes.remove(id) {
                stack.extend(removed_node.children);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;

    #[test]
    fn test_add_and_remove_subtree() {
        let mut scene = Scene::new();
        let a = scene.add_node(scene.root()).unwrap();
        let b = scene.add_node(a).unwrap();
        let _c = scene.add_node(b).unwrap();
        let d = scene.add_node(scene.root()).unwrap();
        assert_eq!(scene.len(), 5);

        assert_eq!(scene.remove_node(a).unwrap(), 3);
        assert_eq!(scene.len(), 2);
        assert_eq!(scene.children(scene.root()).unwrap(), &[d]);
        assert_eq!(scene.set_visible(b, false), Err(SceneError::UnknownNode));
    }

    #[test]
    fn test_reparent_under_descendant_is_rejected() {
        let mut scene = Scene::new();
        let a = scene.add_node(scene.root()).unwrap();
        let b = scene.add_node(a).unwrap();
        let c = scene.add_node(b).unwrap();

        assert_eq!(scene.reparent(a, c), Err(SceneError::WouldCreateCycle));
        assert_eq!(scene.reparent(a, a), Err(SceneError::WouldCreateCycle));
        assert_eq!(scene.reparent(scene.root(), a), Err(SceneError::CannotMoveRoot));
        assert_eq!(scene.remove_node(scene.root()), Err(SceneError::CannotMoveRoot));
    }

    #[test]
    fn test_reparent_moves_node_between_parents() {
        let mut scene = Scene::new();
        let a = scene.add_node(scene.root()).unwrap();
        let b = scene.add_node(scene.root()).unwrap();
        let leaf = scene.add_node(a).unwrap();

        scene.reparent(leaf, b).unwrap();
        assert!(scene.children(a).unwrap().is_empty());
        assert_eq!(scene.children(b).unwrap(), &[leaf]);
        assert_eq!(scene.parent(leaf).unwrap(), Some(b));
    }

    #[test]
    fn test_attach_and_detach() {
        let mut scene = Scene::new();
        let node = scene.add_node(scene.root()).unwrap();
        let light = Light::new(Vec3::new(1.0, 0.5, 0.25));
        scene.attach(node, Attachment::Light(light)).unwrap();
        assert_eq!(scene.attachment(node).unwrap(), Some(&Attachment::Light(light)));
        assert_eq!(scene.detach(node).unwrap(), Some(Attachment::Light(light)));
        assert_eq!(scene.attachment(node).unwrap(), None);
    }

    #[test]
    fn test_default_ambient() {
        let scene = Scene::new();
        assert_eq!(scene.ambient(), Vec4::new(0.2, 0.2, 0.2, 1.0));
    }
}
