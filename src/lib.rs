// Distributed under the GNU Affero General Public License v3.0 or later.
// See accompanying file LICENSE or https://www.gnu.org/licenses/agpl-3.0.html for details.

//! GJK narrow-phase collision for convex shapes described by support functions.

pub mod aabb;
pub mod collision_world;
pub mod convex;
pub mod gjk;
pub mod handles;
pub mod node_pool;
pub mod settings;
pub mod shapes;
pub mod transform;
pub mod utils;

pub use aabb::Aabb;
pub use collision_world::{CollisionList, CollisionWorld, MAX_COLLISIONS, WorldError};
pub use convex::{CollisionLayer, Convex, ConvexKind, SupportMap};
pub use gjk::{CollisionInfo, GjkCollisionState, QueryOutcome, SupportFrames};
pub use handles::{ConvexHandle, StateHandle};
pub use settings::{GjkSettings, SettingsError};
pub use shapes::{BoxShape, PointShape, Polytope, Sphere};
pub use transform::Transform;
