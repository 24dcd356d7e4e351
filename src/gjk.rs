// Distributed under the GNU Affero General Public License v3.0 or later.
// See accompanying file LICENSE or https://www.gnu.org/licenses/agpl-3.0.html for details.

//! Persistent GJK state for one shape pair.
//!
//! The simplex lives in four fixed slots addressed by a bitmask. `y[i]` is the
//! Minkowski-difference point `a2w·p[i] - b2w·q[i]` and is valid only while bit `i`
//! is set in `bits`. Johnson's distance sub-algorithm keeps its dot products in `dp`
//! and its sub-determinants in `det[subset][vertex]`.

use bevy_ecs::entity::Entity;
use glam::{Mat3, Mat4, Vec3};

use crate::{
    convex::SupportMap, handles::ConvexHandle, node_pool::NodeId, settings::GjkSettings,
};

const FULL_SIMPLEX: usize = 15;

/// How the last `intersect`/`distance` call on a state ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    #[default]
    NotRun,
    /// A separating plane was found.
    Separated,
    /// The origin is enclosed or the separation is below tolerance.
    Intersecting,
    /// Upper and lower distance bounds met.
    Converged,
    /// The lower bound passed the caller's `dont_care_dist`.
    BeyondDontCare,
    /// A support point repeated an existing simplex vertex.
    Degenerate,
    /// No sub-simplex passed Johnson's validity test.
    ReductionFailed,
    /// The iteration cap was reached.
    IterationLimit,
}

impl QueryOutcome {
    /// The result is a best-effort value rather than a converged one.
    /// It is still usable; repeating the query with the same inputs gives the same answer.
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            QueryOutcome::Degenerate | QueryOutcome::ReductionFailed | QueryOutcome::IterationLimit
        )
    }
}

/// World placement of both shapes plus the matrices that carry world directions into
/// each shape's local space.
#[derive(Debug, Clone, Copy)]
pub struct SupportFrames {
    pub a2w: Mat4,
    pub b2w: Mat4,
    dir_a: Mat3,
    dir_b: Mat3,
}

impl SupportFrames {
    pub fn new(a2w: Mat4, b2w: Mat4) -> Self {
        // Support points map through the linear part M, so directions map through Mᵀ.
        // This stays exact under non-uniform scale, where the inverse would not.
        Self {
            a2w,
            b2w,
            dir_a: Mat3::from_mat4(a2w).transpose(),
            dir_b: Mat3::from_mat4(b2w).transpose(),
        }
    }

    fn world_a(&self, a: &dyn SupportMap, direction: Vec3) -> (Vec3, Vec3) {
        let local = a.support(self.dir_a * direction);
        (local, self.a2w.transform_point3(local))
    }

    fn world_b(&self, b: &dyn SupportMap, direction: Vec3) -> (Vec3, Vec3) {
        let local = b.support(self.dir_b * direction);
        (local, self.b2w.transform_point3(local))
    }
}

/// Contact data for a shape pair, in the caller's frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionInfo {
    pub point: Vec3,
    /// Unit vector from B's closest point towards A's.
    pub normal: Vec3,
    pub object: Entity,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct GjkCollisionState {
    pub(crate) a: ConvexHandle,
    pub(crate) b: ConvexHandle,
    pub(crate) list_a: Option<NodeId>,
    pub(crate) list_b: Option<NodeId>,

    bits: usize,
    all_bits: usize,
    p: [Vec3; 4],
    q: [Vec3; 4],
    y: [Vec3; 4],
    det: [[f32; 4]; 16],
    dp: [[f32; 4]; 4],
    last: usize,
    last_bit: usize,

    dist: f32,
    distvec: Vec3,

    iterations: u32,
    irregularities: u32,
    outcome: QueryOutcome,
    settings: GjkSettings,
}

impl Default for GjkCollisionState {
    fn default() -> Self {
        Self::new(GjkSettings::default())
    }
}

impl GjkCollisionState {
    pub fn new(settings: GjkSettings) -> Self {
        Self {
            a: ConvexHandle::default(),
            b: ConvexHandle::default(),
            list_a: None,
            list_b: None,
            bits: 0,
            all_bits: 0,
            p: [Vec3::ZERO; 4],
            q: [Vec3::ZERO; 4],
            y: [Vec3::ZERO; 4],
            det: [[0.0; 4]; 16],
            dp: [[0.0; 4]; 4],
            last: 0,
            last_bit: 1,
            dist: 0.0,
            distvec: Vec3::ZERO,
            iterations: 0,
            irregularities: 0,
            outcome: QueryOutcome::NotRun,
            settings,
        }
    }

    pub(crate) fn for_pair(a: ConvexHandle, b: ConvexHandle, settings: GjkSettings) -> Self {
        Self {
            a,
            b,
            ..Self::new(settings)
        }
    }

    pub fn shape_a(&self) -> ConvexHandle {
        self.a
    }

    pub fn shape_b(&self) -> ConvexHandle {
        self.b
    }

    /// Current separation estimate.
    pub fn dist(&self) -> f32 {
        self.dist
    }

    /// Current search direction, pointing from B towards A in world space.
    pub fn separating_vector(&self) -> Vec3 {
        self.distvec
    }

    /// Occupied simplex slots.
    pub fn simplex_bits(&self) -> usize {
        self.bits
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn irregularities(&self) -> u32 {
        self.irregularities
    }

    pub fn outcome(&self) -> QueryOutcome {
        self.outcome
    }

    pub fn settings(&self) -> &GjkSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: GjkSettings) {
        self.settings = settings;
    }

    /// Re-seeds the search direction from each shape's zero-direction support point.
    pub fn reset(&mut self, a: &dyn SupportMap, b: &dyn SupportMap, a2w: &Mat4, b2w: &Mat4) {
        self.seed(a, b, &SupportFrames::new(*a2w, *b2w));
    }

    /// Seeds `distvec`/`dist`. Returns `true` when the reference points coincide, in
    /// which case the seed is stored as a one-point simplex.
    fn seed(&mut self, a: &dyn SupportMap, b: &dyn SupportMap, frames: &SupportFrames) -> bool {
        self.bits = 0;
        self.all_bits = 0;

        let (pa, sa) = frames.world_a(a, Vec3::ZERO);
        let (qb, sb) = frames.world_b(b, Vec3::ZERO);
        self.distvec = sa - sb;
        self.dist = self.distvec.length();

        if self.distvec.length_squared() > self.settings.zero_epsilon {
            return false;
        }

        self.last = 0;
        self.last_bit = 1;
        self.p[0] = pa;
        self.q[0] = qb;
        self.y[0] = self.distvec;
        self.dp[0][0] = self.distvec.length_squared();
        self.det[1][0] = 1.0;
        self.bits = 1;
        self.all_bits = 1;
        true
    }

    pub fn intersect(
        &mut self,
        a: &dyn SupportMap,
        b: &dyn SupportMap,
        a2w: &Mat4,
        b2w: &Mat4,
    ) -> bool {
        self.intersect_with_frames(a, b, &SupportFrames::new(*a2w, *b2w))
    }

    /// Boolean separating-axis test. `true` means the shapes touch or overlap.
    pub fn intersect_with_frames(
        &mut self,
        a: &dyn SupportMap,
        b: &dyn SupportMap,
        frames: &SupportFrames,
    ) -> bool {
        self.iterations = 0;
        if self.seed(a, b, frames) {
            self.outcome = QueryOutcome::Intersecting;
            return true;
        }

        loop {
            self.next_bit();
            let w = self.add_support(a, b, frames);

            if self.distvec.dot(w) > 0.0 {
                self.outcome = QueryOutcome::Separated;
                return false;
            }
            if self.is_degenerate(w) {
                self.irregular(QueryOutcome::Degenerate);
                return false;
            }

            self.y[self.last] = w;
            self.all_bits = self.bits | self.last_bit;

            self.iterations += 1;
            if !self.closest() {
                self.irregular(QueryOutcome::ReductionFailed);
                return false;
            }
            if self.iterations > self.settings.max_iterations {
                self.irregular(QueryOutcome::IterationLimit);
                return false;
            }

            if self.bits == FULL_SIMPLEX
                || self.distvec.length_squared() <= self.settings.zero_epsilon
            {
                self.outcome = QueryOutcome::Intersecting;
                return true;
            }
        }
    }

    pub fn distance(
        &mut self,
        a: &dyn SupportMap,
        b: &dyn SupportMap,
        a2w: &Mat4,
        b2w: &Mat4,
        dont_care_dist: f32,
    ) -> f32 {
        self.distance_with_frames(a, b, &SupportFrames::new(*a2w, *b2w), dont_care_dist)
    }

    /// Separation distance between the shapes, or a lower bound above
    /// `dont_care_dist` once the shapes are known to be at least that far apart.
    ///
    /// Degenerate cases return the best upper bound found so far; see `outcome()`.
    pub fn distance_with_frames(
        &mut self,
        a: &dyn SupportMap,
        b: &dyn SupportMap,
        frames: &SupportFrames,
        dont_care_dist: f32,
    ) -> f32 {
        self.iterations = 0;
        if self.seed(a, b, frames) {
            self.dist = 0.0;
            self.outcome = QueryOutcome::Intersecting;
            return 0.0;
        }

        let mut mu = 0.0_f32;
        loop {
            self.next_bit();
            let w = self.add_support(a, b, frames);

            let nm = self.distvec.dot(w) / self.dist;
            if nm > mu {
                mu = nm;
            }
            if mu > dont_care_dist {
                self.outcome = QueryOutcome::BeyondDontCare;
                return mu;
            }
            if (self.dist - mu).abs() <= self.dist * self.settings.rel_error {
                self.outcome = QueryOutcome::Converged;
                return self.dist;
            }

            self.iterations += 1;
            if self.is_degenerate(w) {
                self.irregular(QueryOutcome::Degenerate);
                return self.dist;
            }
            if self.iterations > self.settings.max_iterations {
                self.irregular(QueryOutcome::IterationLimit);
                return self.dist;
            }

            self.y[self.last] = w;
            self.all_bits = self.bits | self.last_bit;

            if !self.closest() {
                self.irregular(QueryOutcome::ReductionFailed);
                return self.dist;
            }

            self.dist = self.distvec.length();
            if self.bits == FULL_SIMPLEX
                || self.dist <= self.settings.abs_tolerance
                || self.distvec.length_squared() <= self.settings.zero_epsilon
            {
                break;
            }
        }

        if self.bits == FULL_SIMPLEX && mu <= 0.0 {
            self.dist = 0.0;
        }
        self.outcome = if self.bits == FULL_SIMPLEX || self.dist <= self.settings.abs_tolerance {
            QueryOutcome::Intersecting
        } else {
            QueryOutcome::Converged
        };
        self.dist
    }

    /// Witness points on A and B, each in its own shape's local space.
    pub fn closest_points(&self) -> (Vec3, Vec3) {
        if self.bits == 0 {
            return (self.p[self.last], self.q[self.last]);
        }

        let mut sum = 0.0;
        let mut p1 = Vec3::ZERO;
        let mut p2 = Vec3::ZERO;
        for i in Self::slots(self.bits) {
            let weight = self.det[self.bits][i];
            sum += weight;
            p1 += self.p[i] * weight;
            p2 += self.q[i] * weight;
        }
        let s = 1.0 / sum;
        (p1 * s, p2 * s)
    }

    /// Contact point on A placed with `mat`, and the normal from B's witness point
    /// towards it. `b2w` must be the transform B was queried with.
    ///
    /// The normal is not corrected for non-uniform scale in `mat` or `b2w`.
    pub fn collision_info(&self, mat: &Mat4, b2w: &Mat4, object: Entity) -> CollisionInfo {
        let (point, mut normal) = if self.bits != 0 {
            let (pa, pb) = self.closest_points();
            let point = mat.transform_point3(pa);
            (point, point - b2w.transform_point3(pb))
        } else {
            (mat.transform_point3(self.p[self.last]), self.distvec)
        };

        if normal.length_squared() <= self.settings.zero_epsilon {
            normal = self.distvec;
        }

        CollisionInfo {
            point,
            normal: normal.normalize_or_zero(),
            object,
            distance: self.dist,
        }
    }

    /// Exchanges the roles of A and B.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.a, &mut self.b);
        std::mem::swap(&mut self.list_a, &mut self.list_b);
        std::mem::swap(&mut self.p, &mut self.q);
        // `dp` and `det` only depend on dot products of `y`, which negation preserves.
        for y in &mut self.y {
            *y = -*y;
        }
        self.distvec = -self.distvec;
    }

    fn irregular(&mut self, outcome: QueryOutcome) {
        self.irregularities += 1;
        self.outcome = outcome;
        log::debug!(
            "GJK irregularity {:?} after {} iterations (bits {:#06b}, dist {})",
            outcome,
            self.iterations,
            self.bits,
            self.dist
        );
    }

    fn slots(bits: usize) -> impl Iterator<Item = usize> {
        (0..4).filter(move |i| bits & (1 << i) != 0)
    }

    fn next_bit(&mut self) {
        self.last = 0;
        self.last_bit = 1;
        while self.bits & self.last_bit != 0 {
            self.last += 1;
            self.last_bit <<= 1;
        }
    }

    /// Fills `p[last]`/`q[last]` and returns the new Minkowski-difference point.
    fn add_support(&mut self, a: &dyn SupportMap, b: &dyn SupportMap, frames: &SupportFrames) -> Vec3 {
        let (pa, sa) = frames.world_a(a, -self.distvec);
        let (qb, sb) = frames.world_b(b, self.distvec);
        self.p[self.last] = pa;
        self.q[self.last] = qb;
        sa - sb
    }

    /// Support outputs are exact, so an exact repeat means no progress is possible.
    fn is_degenerate(&self, w: Vec3) -> bool {
        Self::slots(self.all_bits).any(|i| self.y[i] == w)
    }

    fn compute_det(&mut self) {
        let last = self.last;
        let last_bit = self.last_bit;

        for i in Self::slots(self.bits) {
            let d = self.y[i].dot(self.y[last]);
            self.dp[i][last] = d;
            self.dp[last][i] = d;
        }
        self.dp[last][last] = self.y[last].dot(self.y[last]);

        let dp = self.dp;
        self.det[last_bit][last] = 1.0;
        for j in Self::slots(self.bits) {
            let sj = 1 << j;
            let s2 = sj | last_bit;
            self.det[s2][j] = dp[last][last] - dp[last][j];
            self.det[s2][last] = dp[j][j] - dp[j][last];

            for k in Self::slots(self.bits).filter(|&k| k < j) {
                let sk = 1 << k;
                let s3 = sk | s2;
                self.det[s3][k] = self.det[s2][j] * (dp[j][j] - dp[j][k])
                    + self.det[s2][last] * (dp[last][j] - dp[last][k]);
                self.det[s3][j] = self.det[sk | last_bit][k] * (dp[k][k] - dp[k][j])
                    + self.det[sk | last_bit][last] * (dp[last][k] - dp[last][j]);
                self.det[s3][last] = self.det[sk | sj][k] * (dp[k][k] - dp[k][last])
                    + self.det[sk | sj][j] * (dp[j][k] - dp[j][last]);
            }
        }

        if self.all_bits == FULL_SIMPLEX {
            let det = &mut self.det;
            det[15][0] = det[14][1] * (dp[1][1] - dp[1][0])
                + det[14][2] * (dp[2][1] - dp[2][0])
                + det[14][3] * (dp[3][1] - dp[3][0]);
            det[15][1] = det[13][0] * (dp[0][0] - dp[0][1])
                + det[13][2] * (dp[2][0] - dp[2][1])
                + det[13][3] * (dp[3][0] - dp[3][1]);
            det[15][2] = det[11][0] * (dp[0][0] - dp[0][2])
                + det[11][1] * (dp[1][0] - dp[1][2])
                + det[11][3] * (dp[3][0] - dp[3][2]);
            det[15][3] = det[7][0] * (dp[0][0] - dp[0][3])
                + det[7][1] * (dp[1][0] - dp[1][3])
                + det[7][2] * (dp[2][0] - dp[2][3]);
        }
    }

    /// Subset `s` of `all_bits` is valid when the origin's projection onto its affine
    /// hull lies inside it and no other active vertex would pull the projection closer.
    fn is_valid(&self, s: usize) -> bool {
        Self::slots(self.all_bits).all(|i| {
            let bit = 1 << i;
            if s & bit != 0 {
                self.det[s][i] > 0.0
            } else {
                self.det[s | bit][i] <= 0.0
            }
        })
    }

    fn compute_vector(&self, bits: usize) -> Vec3 {
        let mut sum = 0.0;
        let mut v = Vec3::ZERO;
        for i in Self::slots(bits) {
            sum += self.det[bits][i];
            v += self.y[i] * self.det[bits][i];
        }
        v * (1.0 / sum)
    }

    /// Reduces the simplex to the smallest sub-simplex nearest the origin that still
    /// contains the newest vertex, and moves `distvec` onto it.
    fn closest(&mut self) -> bool {
        self.compute_det();

        let mut s = self.bits;
        while s != 0 {
            if s & self.bits == s && self.is_valid(s | self.last_bit) {
                self.bits = s | self.last_bit;
                if self.bits != FULL_SIMPLEX {
                    self.distvec = self.compute_vector(self.bits);
                }
                return true;
            }
            s -= 1;
        }

        if self.is_valid(self.last_bit) {
            self.bits = self.last_bit;
            self.distvec = self.y[self.last];
            return true;
        }
        false
    }
}
