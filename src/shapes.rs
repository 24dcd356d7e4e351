use glam::Vec3;

use crate::{
    aabb::Aabb,
    convex::{ConvexKind, SupportMap},
};

/// Box centred on the local origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxShape {
    pub half_extents: Vec3,
}

impl BoxShape {
    pub fn new(half_extents: Vec3) -> Self {
        Self {
            half_extents: half_extents.abs(),
        }
    }

    pub fn cube(size: f32) -> Self {
        Self::new(Vec3::splat(size * 0.5))
    }

    pub fn vertices(&self) -> [Vec3; 8] {
        let h = self.half_extents;
        [
            Vec3::new(-h.x, -h.y, -h.z),
            Vec3::new(-h.x, -h.y, h.z),
            Vec3::new(-h.x, h.y, -h.z),
            Vec3::new(-h.x, h.y, h.z),
            Vec3::new(h.x, -h.y, -h.z),
            Vec3::new(h.x, -h.y, h.z),
            Vec3::new(h.x, h.y, -h.z),
            Vec3::new(h.x, h.y, h.z),
        ]
    }
}

impl SupportMap for BoxShape {
    fn support(&self, direction: Vec3) -> Vec3 {
        let h = self.half_extents;
        Vec3::new(
            if direction.x >= 0.0 { h.x } else { -h.x },
            if direction.y >= 0.0 { h.y } else { -h.y },
            if direction.z >= 0.0 { h.z } else { -h.z },
        )
    }

    fn local_bounds(&self) -> Aabb {
        Aabb::new(-self.half_extents, self.half_extents)
    }

    fn kind(&self) -> ConvexKind {
        ConvexKind::Box
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub radius: f32,
}

impl Sphere {
    pub fn new(radius: f32) -> Self {
        Self {
            radius: radius.abs(),
        }
    }
}

impl SupportMap for Sphere {
    fn support(&self, direction: Vec3) -> Vec3 {
        // The centre is the reference point for a zero direction.
        direction.normalize_or_zero() * self.radius
    }

    fn local_bounds(&self) -> Aabb {
        Aabb::new(Vec3::splat(-self.radius), Vec3::splat(self.radius))
    }

    fn kind(&self) -> ConvexKind {
        ConvexKind::Sphere
    }
}

/// Convex hull of a point cloud. Interior points are allowed and simply never win.
#[derive(Debug, Clone, PartialEq)]
pub struct Polytope {
    points: Vec<Vec3>,
    bounds: Aabb,
}

impl Polytope {
    /// Returns `None` for an empty point set.
    pub fn new(points: Vec<Vec3>) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let bounds = Aabb::from_points(&points);
        Some(Self { points, bounds })
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }
}

impl SupportMap for Polytope {
    fn support(&self, direction: Vec3) -> Vec3 {
        // Strict comparison keeps the lowest index on ties.
        let mut best = self.points[0];
        let mut best_dot = best.dot(direction);
        for p in self.points.iter().skip(1) {
            let d = p.dot(direction);
            if d > best_dot {
                best_dot = d;
                best = *p;
            }
        }
        best
    }

    fn local_bounds(&self) -> Aabb {
        self.bounds
    }

    fn kind(&self) -> ConvexKind {
        ConvexKind::Polytope
    }
}

/// A single point. Degenerate, but a valid convex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointShape {
    pub point: Vec3,
}

impl PointShape {
    pub fn new(point: Vec3) -> Self {
        Self { point }
    }
}

impl SupportMap for PointShape {
    fn support(&self, _direction: Vec3) -> Vec3 {
        self.point
    }

    fn local_bounds(&self) -> Aabb {
        Aabb::new(self.point, self.point)
    }

    fn kind(&self) -> ConvexKind {
        ConvexKind::Point
    }
}
