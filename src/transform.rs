use glam::{Mat4, Quat, Vec3};

/// Position/rotation/scale placement of a convex in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Translation and rotation only. Scale is kept separately on a convex.
    pub fn rigid_mat4(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    pub fn to_mat4(&self) -> Mat4 {
        let translation_matrix = Mat4::from_translation(self.position);
        let rotation_matrix = Mat4::from_quat(self.rotation);
        let scale_matrix = Mat4::from_scale(self.scale);

        translation_matrix * rotation_matrix * scale_matrix
    }
}

/// Folds `scale` into `mat` so that local points are scaled before being placed.
pub fn scaled(mat: &Mat4, scale: Vec3) -> Mat4 {
    *mat * Mat4::from_scale(scale)
}
