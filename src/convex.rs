use bevy_ecs::entity::Entity;
use glam::{Mat4, Vec3};

use crate::{
    aabb::Aabb,
    node_pool::ListHead,
    transform::{self, Transform},
};

/// Discriminates shape variants for caller-side dispatch. The GJK math never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvexKind {
    Box,
    Sphere,
    Polytope,
    Point,
    Custom(u32),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollisionLayer {
    #[default]
    Default,
    Player,
    Enemy,
    Environment,
}

impl CollisionLayer {
    pub const ALL: u32 = u32::MAX;

    pub fn bit(self) -> u32 {
        match self {
            CollisionLayer::Default => 1 << 0,
            CollisionLayer::Player => 1 << 1,
            CollisionLayer::Enemy => 1 << 2,
            CollisionLayer::Environment => 1 << 3,
        }
    }

    pub fn matches(self, mask: u32) -> bool {
        self.bit() & mask != 0
    }
}

/// The one capability GJK needs from a shape.
pub trait SupportMap: Send + Sync {
    /// Local-space point of the shape farthest along `direction`.
    ///
    /// Must be deterministic. A zero `direction` must return a fixed reference point
    /// of the shape.
    fn support(&self, direction: Vec3) -> Vec3;

    /// Local-space bounds of the shape.
    fn local_bounds(&self) -> Aabb;

    fn kind(&self) -> ConvexKind;
}

/// A convex collision proxy bound to a scene entity.
pub struct Convex {
    owner: Entity,
    layer: CollisionLayer,
    shape: Box<dyn SupportMap>,
    transform: Mat4,
    scale: Vec3,
    /// States pairing this convex with another one.
    pub(crate) state_list: ListHead,
    /// Candidate partners inside this convex's query bound.
    pub(crate) working_list: ListHead,
    /// Working-list entries of other convexes that point at this one.
    pub(crate) reference_list: ListHead,
}

impl Convex {
    pub fn new(owner: Entity, shape: impl SupportMap + 'static, layer: CollisionLayer) -> Self {
        Self {
            owner,
            layer,
            shape: Box::new(shape),
            transform: Mat4::IDENTITY,
            scale: Vec3::ONE,
            state_list: ListHead::default(),
            working_list: ListHead::default(),
            reference_list: ListHead::default(),
        }
    }

    pub fn with_transform(mut self, transform: Mat4, scale: Vec3) -> Self {
        self.set_transform(transform, scale);
        self
    }

    /// Places the convex from a position/rotation/scale triple.
    pub fn with_placement(self, placement: &Transform) -> Self {
        self.with_transform(placement.rigid_mat4(), placement.scale)
    }

    pub fn owner(&self) -> Entity {
        self.owner
    }

    pub fn kind(&self) -> ConvexKind {
        self.shape.kind()
    }

    pub fn layer(&self) -> CollisionLayer {
        self.layer
    }

    pub fn shape(&self) -> &dyn SupportMap {
        self.shape.as_ref()
    }

    pub fn support(&self, direction: Vec3) -> Vec3 {
        self.shape.support(direction)
    }

    /// Placement without scale.
    pub fn transform(&self) -> &Mat4 {
        &self.transform
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn set_transform(&mut self, transform: Mat4, scale: Vec3) {
        self.transform = transform;
        self.scale = scale;
    }

    /// Local-to-world matrix with the scale folded in.
    pub fn world_matrix(&self) -> Mat4 {
        transform::scaled(&self.transform, self.scale)
    }

    pub fn bounding_box(&self) -> Aabb {
        self.bounding_box_at(&self.transform, self.scale)
    }

    /// World bounds as if the convex were placed at `mat` with `scale`.
    pub fn bounding_box_at(&self, mat: &Mat4, scale: Vec3) -> Aabb {
        self.shape
            .local_bounds()
            .transformed(&transform::scaled(mat, scale))
    }

    pub fn state_count(&self) -> usize {
        self.state_list.len()
    }

    pub fn working_count(&self) -> usize {
        self.working_list.len()
    }
}
