// Distributed under the GNU Affero General Public License v3.0 or later.
// See accompanying file LICENSE or https://www.gnu.org/licenses/agpl-3.0.html for details.

//! Per-world registry of convexes, their working lists and the GJK states that
//! pair them up.
//!
//! Every convex owns three list heads:
//! - `state_list`: one node per collision state the convex takes part in,
//! - `working_list`: candidate partners found by the last broad-phase query,
//! - `reference_list`: working-list entries of other convexes pointing at it.
//!
//! A working-list node sits in two lists at once (the owner's working list and
//! the partner's reference list), so removing a convex can find and drop every
//! entry that mentions it without scanning the world.

use std::collections::HashSet;

use bevy_ecs::prelude::Resource;
use glam::{Mat4, Vec3};
use rayon::prelude::*;
use slotmap::SlotMap;
use thiserror::Error;

use crate::{
    aabb::Aabb,
    convex::Convex,
    gjk::{CollisionInfo, GjkCollisionState, SupportFrames},
    handles::{ConvexHandle, StateHandle},
    node_pool::{NodeId, NodePool},
    settings::GjkSettings,
    transform,
    utils::scope_timer::ScopeTimer,
};

/// Upper bound on contacts gathered by one `collision_info` call.
pub const MAX_COLLISIONS: usize = 64;

const STATE_LANE: usize = 0;
const WORKING_LANE: usize = 0;
const REFERENCE_LANE: usize = 1;

/// Entry of a working list: `owner` considers `partner` a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingLink {
    pub owner: ConvexHandle,
    pub partner: ConvexHandle,
}

pub type CollisionStateList = NodePool<StateHandle, 1>;
pub type CollisionWorkingList = NodePool<WorkingLink, 2>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("Unknown convex {0:?}")]
    UnknownConvex(ConvexHandle),

    #[error("Unknown collision state {0:?}")]
    UnknownState(StateHandle),

    #[error("A convex cannot be paired with itself ({0:?})")]
    SelfPair(ConvexHandle),
}

/// Bounded list of contacts, filled by [`CollisionWorld::collision_info`].
#[derive(Debug, Clone, Default)]
pub struct CollisionList {
    collisions: Vec<CollisionInfo>,
}

impl CollisionList {
    pub const MAX_COLLISIONS: usize = MAX_COLLISIONS;

    pub fn new() -> Self {
        Self {
            collisions: Vec::with_capacity(MAX_COLLISIONS),
        }
    }

    /// Returns `false` and drops `info` when the list is full.
    pub fn push(&mut self, info: CollisionInfo) -> bool {
        if self.is_full() {
            return false;
        }
        self.collisions.push(info);
        true
    }

    pub fn clear(&mut self) {
        self.collisions.clear();
    }

    pub fn len(&self) -> usize {
        self.collisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collisions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.collisions.len() >= MAX_COLLISIONS
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollisionInfo> {
        self.collisions.iter()
    }

    pub fn as_slice(&self) -> &[CollisionInfo] {
        &self.collisions
    }
}

#[derive(Resource, Default)]
pub struct CollisionWorld {
    convexes: SlotMap<ConvexHandle, Convex>,
    states: SlotMap<StateHandle, GjkCollisionState>,
    state_links: CollisionStateList,
    working_links: CollisionWorkingList,
    settings: GjkSettings,
    /// Irregularities of states that have since been unregistered.
    retired_irregularities: u64,
}

impl CollisionWorld {
    pub fn new(settings: GjkSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &GjkSettings {
        &self.settings
    }

    /// Replaces the settings of the world and of every live state.
    pub fn set_settings(&mut self, settings: GjkSettings) {
        self.settings = settings;
        for state in self.states.values_mut() {
            state.set_settings(settings);
        }
    }

    // Convexes

    pub fn add_convex(&mut self, convex: Convex) -> ConvexHandle {
        let handle = self.convexes.insert(convex);
        log::trace!("Added convex {:?}", handle);
        handle
    }

    /// Removes a convex together with its states and every working-list entry
    /// that mentions it, in either direction.
    pub fn remove_convex(&mut self, handle: ConvexHandle) -> Option<Convex> {
        let convex = self.convexes.get(handle)?;
        let states: Vec<StateHandle> = self
            .state_links
            .iter(&convex.state_list, STATE_LANE)
            .map(|(_, state)| *state)
            .collect();
        let mut links = self.working_links.ids(&convex.working_list, WORKING_LANE);
        links.extend(self.working_links.ids(&convex.reference_list, REFERENCE_LANE));

        for state in states {
            self.unlink_state(state);
        }
        for link in links {
            self.unlink_working_node(link);
        }

        log::trace!("Removed convex {:?}", handle);
        self.convexes.remove(handle)
    }

    pub fn convex(&self, handle: ConvexHandle) -> Option<&Convex> {
        self.convexes.get(handle)
    }

    pub fn convex_mut(&mut self, handle: ConvexHandle) -> Option<&mut Convex> {
        self.convexes.get_mut(handle)
    }

    pub fn convexes(&self) -> impl Iterator<Item = (ConvexHandle, &Convex)> {
        self.convexes.iter()
    }

    pub fn convex_count(&self) -> usize {
        self.convexes.len()
    }

    pub fn set_transform(
        &mut self,
        handle: ConvexHandle,
        transform: Mat4,
        scale: Vec3,
    ) -> Result<(), WorldError> {
        self.convexes
            .get_mut(handle)
            .ok_or(WorldError::UnknownConvex(handle))?
            .set_transform(transform, scale);
        Ok(())
    }

    // Working lists

    /// Appends `partner` to `owner`'s working list.
    pub fn add_to_working_list(
        &mut self,
        owner: ConvexHandle,
        partner: ConvexHandle,
    ) -> Result<(), WorldError> {
        if owner == partner {
            return Err(WorldError::SelfPair(owner));
        }
        self.check_convex(owner)?;
        self.check_convex(partner)?;

        let id = self.working_links.alloc(WorkingLink { owner, partner });
        if let Some(convex) = self.convexes.get_mut(owner) {
            self.working_links
                .push_back(&mut convex.working_list, WORKING_LANE, id);
        }
        if let Some(convex) = self.convexes.get_mut(partner) {
            self.working_links
                .push_back(&mut convex.reference_list, REFERENCE_LANE, id);
        }
        Ok(())
    }

    /// Removes the first entry for `partner` from `owner`'s working list.
    /// Returns whether one was found.
    pub fn remove_from_working_list(&mut self, owner: ConvexHandle, partner: ConvexHandle) -> bool {
        let Some(convex) = self.convexes.get(owner) else {
            return false;
        };
        let found = self
            .working_links
            .iter(&convex.working_list, WORKING_LANE)
            .find(|(_, link)| link.partner == partner)
            .map(|(id, _)| id);

        match found {
            Some(id) => {
                self.unlink_working_node(id);
                true
            }
            None => false,
        }
    }

    pub fn clear_working_list(&mut self, owner: ConvexHandle) {
        let Some(convex) = self.convexes.get(owner) else {
            return;
        };
        for id in self.working_links.ids(&convex.working_list, WORKING_LANE) {
            self.unlink_working_node(id);
        }
    }

    /// Partners in `owner`'s working list, in insertion order.
    pub fn working_list(&self, owner: ConvexHandle) -> Vec<ConvexHandle> {
        self.convexes
            .get(owner)
            .map(|convex| {
                self.working_links
                    .iter(&convex.working_list, WORKING_LANE)
                    .map(|(_, link)| link.partner)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Convexes whose working lists contain `partner`.
    pub fn references(&self, partner: ConvexHandle) -> Vec<ConvexHandle> {
        self.convexes
            .get(partner)
            .map(|convex| {
                self.working_links
                    .iter(&convex.reference_list, REFERENCE_LANE)
                    .map(|(_, link)| link.owner)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rebuilds `owner`'s working list from the convexes whose bounds overlap
    /// `query_box` and whose layer is in `collision_mask`. Entries that still
    /// qualify keep their place in the list.
    pub fn update_working_list(
        &mut self,
        owner: ConvexHandle,
        query_box: &Aabb,
        collision_mask: u32,
    ) -> Result<(), WorldError> {
        let _timer = ScopeTimer::new("CollisionWorld::update_working_list");
        let convex = self.convexes.get(owner).ok_or(WorldError::UnknownConvex(owner))?;

        let qualifies = |other: &Convex| {
            other.layer().matches(collision_mask) && other.bounding_box().intersects(query_box)
        };

        let mut present = HashSet::new();
        let mut stale = Vec::new();
        for (id, link) in self.working_links.iter(&convex.working_list, WORKING_LANE) {
            match self.convexes.get(link.partner) {
                Some(other) if qualifies(other) && present.insert(link.partner) => {}
                _ => stale.push(id),
            }
        }

        let fresh: Vec<ConvexHandle> = self
            .convexes
            .iter()
            .filter(|(handle, other)| {
                *handle != owner && !present.contains(handle) && qualifies(*other)
            })
            .map(|(handle, _)| handle)
            .collect();

        for id in stale {
            self.unlink_working_node(id);
        }
        for partner in fresh {
            self.add_to_working_list(owner, partner)?;
        }
        Ok(())
    }

    // States

    /// Creates a state for the pair and links it into both convexes' state lists.
    pub fn register_pair(
        &mut self,
        a: ConvexHandle,
        b: ConvexHandle,
    ) -> Result<StateHandle, WorldError> {
        if a == b {
            return Err(WorldError::SelfPair(a));
        }
        let a2w = self
            .convexes
            .get(a)
            .ok_or(WorldError::UnknownConvex(a))?
            .world_matrix();
        let b2w = self
            .convexes
            .get(b)
            .ok_or(WorldError::UnknownConvex(b))?
            .world_matrix();
        Ok(self.insert_state(a, b, a2w, b2w))
    }

    /// Destroys a state and unlinks it from both convexes.
    pub fn unregister_pair(&mut self, state: StateHandle) -> Result<(), WorldError> {
        if self.unlink_state(state) {
            Ok(())
        } else {
            log::warn!("Collision state {:?} is not registered in this world", state);
            Err(WorldError::UnknownState(state))
        }
    }

    pub fn state(&self, handle: StateHandle) -> Option<&GjkCollisionState> {
        self.states.get(handle)
    }

    pub fn states(&self) -> impl Iterator<Item = (StateHandle, &GjkCollisionState)> {
        self.states.iter()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// States `handle` takes part in, in insertion order.
    pub fn states_of(&self, handle: ConvexHandle) -> Vec<StateHandle> {
        self.convexes
            .get(handle)
            .map(|convex| {
                self.state_links
                    .iter(&convex.state_list, STATE_LANE)
                    .map(|(_, state)| *state)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Brings `handle`'s states in line with its working list for a move to `mat`.
    ///
    /// States whose partner no longer overlaps the (margin-grown, swept) bounds
    /// are destroyed. Working-list partners that overlap and have no state yet
    /// get a new one, seeded at `mat`.
    pub fn update_state_list(
        &mut self,
        handle: ConvexHandle,
        mat: &Mat4,
        scale: Vec3,
        displacement: Option<Vec3>,
    ) -> Result<(), WorldError> {
        let _timer = ScopeTimer::new("CollisionWorld::update_state_list");
        let convex = self.convexes.get(handle).ok_or(WorldError::UnknownConvex(handle))?;

        let mut bounds = convex
            .bounding_box_at(mat, scale)
            .expanded(self.settings.state_margin);
        if let Some(displacement) = displacement {
            bounds = bounds.swept(displacement);
        }

        let mut paired = HashSet::new();
        let mut dropped = Vec::new();
        for (_, &state_handle) in self.state_links.iter(&convex.state_list, STATE_LANE) {
            let Some(state) = self.states.get(state_handle) else {
                continue;
            };
            let other = if state.a == handle { state.b } else { state.a };
            paired.insert(other);
            let overlapping = self
                .convexes
                .get(other)
                .is_some_and(|c| bounds.intersects(&c.bounding_box()));
            if !overlapping {
                dropped.push(state_handle);
            }
        }

        let mut created = Vec::new();
        for (_, link) in self.working_links.iter(&convex.working_list, WORKING_LANE) {
            if !paired.insert(link.partner) {
                continue;
            }
            if let Some(other) = self.convexes.get(link.partner) {
                if bounds.intersects(&other.bounding_box()) {
                    created.push((link.partner, other.world_matrix()));
                }
            }
        }

        for state in dropped {
            self.unlink_state(state);
        }
        let a2w = transform::scaled(mat, scale);
        for (partner, b2w) in created {
            self.insert_state(handle, partner, a2w, b2w);
        }
        Ok(())
    }

    /// Refreshes `handle`'s states for placement `mat` and runs the distance
    /// query on each, with `handle` as shape A.
    ///
    /// Returns the state with the smallest distance if it is within
    /// `dont_care_dist`.
    pub fn find_closest_state(
        &mut self,
        handle: ConvexHandle,
        mat: &Mat4,
        scale: Vec3,
        dont_care_dist: f32,
    ) -> Result<Option<(StateHandle, f32)>, WorldError> {
        let _timer = ScopeTimer::new("CollisionWorld::find_closest_state");
        self.update_state_list(handle, mat, scale, None)?;

        let a2w = transform::scaled(mat, scale);
        let mut closest: Option<(StateHandle, f32)> = None;
        for (node, state_handle) in self.state_nodes(handle) {
            let Some(state) = oriented(&mut self.states, state_handle, node) else {
                continue;
            };
            let (Some(a), Some(b)) = (self.convexes.get(state.a), self.convexes.get(state.b))
            else {
                continue;
            };

            let frames = SupportFrames::new(a2w, b.world_matrix());
            let dist = state.distance_with_frames(a.shape(), b.shape(), &frames, dont_care_dist);
            if closest.is_none_or(|(_, best)| dist < best) {
                closest = Some((state_handle, dist));
            }
        }

        Ok(closest.filter(|(_, dist)| *dist <= dont_care_dist))
    }

    /// Appends a contact for every state of `handle` whose last computed distance
    /// is within `tolerance`. Returns `false` if `list` filled up first.
    ///
    /// Reads the distances left by the last `find_closest_state` or
    /// `distance_all_states` call; no query is run here.
    pub fn collision_info(
        &mut self,
        handle: ConvexHandle,
        mat: &Mat4,
        scale: Vec3,
        tolerance: f32,
        list: &mut CollisionList,
    ) -> Result<bool, WorldError> {
        self.check_convex(handle)?;

        let a2w = transform::scaled(mat, scale);
        for (node, state_handle) in self.state_nodes(handle) {
            let Some(state) = oriented(&mut self.states, state_handle, node) else {
                continue;
            };
            if state.dist() > tolerance {
                continue;
            }
            let Some(b) = self.convexes.get(state.b) else {
                continue;
            };
            if !list.push(state.collision_info(&a2w, &b.world_matrix(), b.owner())) {
                log::debug!(
                    "Collision list for {:?} is full at {} contacts",
                    handle,
                    MAX_COLLISIONS
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the distance query on every registered state in parallel, using each
    /// convex's stored transform.
    pub fn distance_all_states(&mut self, dont_care_dist: f32) -> Vec<(StateHandle, f32)> {
        let _timer = ScopeTimer::new("CollisionWorld::distance_all_states");
        let convexes = &self.convexes;
        let mut states: Vec<(StateHandle, &mut GjkCollisionState)> =
            self.states.iter_mut().collect();

        states
            .par_iter_mut()
            .map(|(handle, state)| {
                let dist = match (convexes.get(state.a), convexes.get(state.b)) {
                    (Some(a), Some(b)) => state.distance(
                        a.shape(),
                        b.shape(),
                        &a.world_matrix(),
                        &b.world_matrix(),
                        dont_care_dist,
                    ),
                    _ => f32::INFINITY,
                };
                (*handle, dist)
            })
            .collect()
    }

    // One-shot queries

    /// Boolean overlap test at the convexes' stored transforms. Leaves no state
    /// behind.
    pub fn intersect(&self, a: ConvexHandle, b: ConvexHandle) -> Result<bool, WorldError> {
        let convex_a = self.convexes.get(a).ok_or(WorldError::UnknownConvex(a))?;
        let convex_b = self.convexes.get(b).ok_or(WorldError::UnknownConvex(b))?;
        let mut state = GjkCollisionState::new(self.settings);
        Ok(state.intersect(
            convex_a.shape(),
            convex_b.shape(),
            &convex_a.world_matrix(),
            &convex_b.world_matrix(),
        ))
    }

    pub fn distance(
        &self,
        a: ConvexHandle,
        b: ConvexHandle,
        dont_care_dist: f32,
    ) -> Result<f32, WorldError> {
        let convex_a = self.convexes.get(a).ok_or(WorldError::UnknownConvex(a))?;
        let convex_b = self.convexes.get(b).ok_or(WorldError::UnknownConvex(b))?;
        let mut state = GjkCollisionState::new(self.settings);
        Ok(state.distance(
            convex_a.shape(),
            convex_b.shape(),
            &convex_a.world_matrix(),
            &convex_b.world_matrix(),
            dont_care_dist,
        ))
    }

    /// Total irregularities over every state this world has run, live or not.
    pub fn irregularities(&self) -> u64 {
        self.retired_irregularities
            + self
                .states
                .values()
                .map(|state| u64::from(state.irregularities()))
                .sum::<u64>()
    }

    /// Live and allocated node counts for the (state, working) link pools.
    pub fn pool_usage(&self) -> ((usize, usize), (usize, usize)) {
        (
            (self.state_links.len(), self.state_links.capacity()),
            (self.working_links.len(), self.working_links.capacity()),
        )
    }

    fn check_convex(&self, handle: ConvexHandle) -> Result<(), WorldError> {
        if self.convexes.contains_key(handle) {
            Ok(())
        } else {
            log::warn!("Convex {:?} is not registered in this world", handle);
            Err(WorldError::UnknownConvex(handle))
        }
    }

    fn state_nodes(&self, handle: ConvexHandle) -> Vec<(NodeId, StateHandle)> {
        self.convexes
            .get(handle)
            .map(|convex| {
                self.state_links
                    .iter(&convex.state_list, STATE_LANE)
                    .map(|(id, state)| (id, *state))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert_state(
        &mut self,
        a: ConvexHandle,
        b: ConvexHandle,
        a2w: Mat4,
        b2w: Mat4,
    ) -> StateHandle {
        let mut state = GjkCollisionState::for_pair(a, b, self.settings);
        if let (Some(convex_a), Some(convex_b)) = (self.convexes.get(a), self.convexes.get(b)) {
            state.reset(convex_a.shape(), convex_b.shape(), &a2w, &b2w);
        }

        let handle = self.states.insert(state);
        let node_a = self.state_links.alloc(handle);
        let node_b = self.state_links.alloc(handle);
        if let Some(convex) = self.convexes.get_mut(a) {
            self.state_links
                .push_back(&mut convex.state_list, STATE_LANE, node_a);
        }
        if let Some(convex) = self.convexes.get_mut(b) {
            self.state_links
                .push_back(&mut convex.state_list, STATE_LANE, node_b);
        }
        if let Some(state) = self.states.get_mut(handle) {
            state.list_a = Some(node_a);
            state.list_b = Some(node_b);
        }

        log::trace!("Created collision state {:?} for {:?} and {:?}", handle, a, b);
        handle
    }

    fn unlink_state(&mut self, handle: StateHandle) -> bool {
        let Some(state) = self.states.remove(handle) else {
            return false;
        };

        for (convex, node) in [(state.a, state.list_a), (state.b, state.list_b)] {
            let Some(node) = node else {
                continue;
            };
            if let Some(convex) = self.convexes.get_mut(convex) {
                self.state_links
                    .unlink(&mut convex.state_list, STATE_LANE, node);
            }
            self.state_links.free(node);
        }

        self.retired_irregularities += u64::from(state.irregularities());
        log::trace!("Destroyed collision state {:?}", handle);
        true
    }

    fn unlink_working_node(&mut self, id: NodeId) {
        let Some(link) = self.working_links.get(id).copied() else {
            return;
        };
        if let Some(convex) = self.convexes.get_mut(link.owner) {
            self.working_links
                .unlink(&mut convex.working_list, WORKING_LANE, id);
        }
        if let Some(convex) = self.convexes.get_mut(link.partner) {
            self.working_links
                .unlink(&mut convex.reference_list, REFERENCE_LANE, id);
        }
        self.working_links.free(id);
    }
}

/// Swaps the state if needed so that the convex reached through `node` is A.
fn oriented(
    states: &mut SlotMap<StateHandle, GjkCollisionState>,
    handle: StateHandle,
    node: NodeId,
) -> Option<&mut GjkCollisionState> {
    let state = states.get_mut(handle)?;
    if state.list_a != Some(node) {
        state.swap();
    }
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        convex::CollisionLayer,
        shapes::{BoxShape, Sphere},
    };
    use approx::assert_relative_eq;
    use bevy_ecs::world::World;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::HashMap;

    fn cube_at(world: &mut World, position: Vec3, layer: CollisionLayer) -> Convex {
        let owner = world.spawn_empty().id();
        Convex::new(owner, BoxShape::new(Vec3::splat(0.5)), layer)
            .with_transform(Mat4::from_translation(position), Vec3::ONE)
    }

    /// Checks every list against the states and working links the world should have.
    fn assert_lists_consistent(
        world: &CollisionWorld,
        expected_working: &HashMap<ConvexHandle, Vec<ConvexHandle>>,
    ) {
        for (handle, _) in world.convexes() {
            let expected = expected_working.get(&handle).cloned().unwrap_or_default();
            assert_eq!(world.working_list(handle), expected, "working list of {:?}", handle);

            let mut references = world.references(handle);
            let mut expected_refs: Vec<ConvexHandle> = expected_working
                .iter()
                .flat_map(|(owner, partners)| {
                    partners.iter().filter(|p| **p == handle).map(move |_| *owner)
                })
                .collect();
            references.sort();
            expected_refs.sort();
            assert_eq!(references, expected_refs, "references of {:?}", handle);

            let mut from_lists = world.states_of(handle);
            let mut from_states: Vec<StateHandle> = world
                .states()
                .filter(|(_, s)| s.shape_a() == handle || s.shape_b() == handle)
                .map(|(h, _)| h)
                .collect();
            from_lists.sort();
            from_states.sort();
            assert_eq!(from_lists, from_states, "states of {:?}", handle);
        }
    }

    #[test]
    fn lists_stay_consistent_under_random_edits() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut live: Vec<ConvexHandle> = Vec::new();
        let mut expected: HashMap<ConvexHandle, Vec<ConvexHandle>> = HashMap::new();

        for _ in 0..600 {
            match rng.random_range(0..6) {
                0 | 1 if live.len() < 12 => {
                    let position = Vec3::new(rng.random_range(-5.0..5.0), 0.0, 0.0);
                    live.push(world.add_convex(cube_at(&mut ecs, position, CollisionLayer::Default)));
                }
                2 if live.len() >= 2 => {
                    let owner = live[rng.random_range(0..live.len())];
                    let partner = live[rng.random_range(0..live.len())];
                    if owner != partner {
                        world.add_to_working_list(owner, partner).expect("live pair");
                        expected.entry(owner).or_default().push(partner);
                    }
                }
                3 if !live.is_empty() => {
                    let owner = live[rng.random_range(0..live.len())];
                    let partner = live[rng.random_range(0..live.len())];
                    let entries = expected.entry(owner).or_default();
                    let position = entries.iter().position(|p| *p == partner);
                    assert_eq!(world.remove_from_working_list(owner, partner), position.is_some());
                    if let Some(index) = position {
                        entries.remove(index);
                    }
                }
                4 if live.len() >= 2 => {
                    let a = live[rng.random_range(0..live.len())];
                    let b = live[rng.random_range(0..live.len())];
                    if a != b {
                        world.register_pair(a, b).expect("live pair");
                    } else {
                        let states = world.states_of(a);
                        if let Some(state) = states.first() {
                            world.unregister_pair(*state).expect("live state");
                        }
                    }
                }
                5 if !live.is_empty() => {
                    let index = rng.random_range(0..live.len());
                    let removed = live.swap_remove(index);
                    assert!(world.remove_convex(removed).is_some());
                    expected.remove(&removed);
                    for partners in expected.values_mut() {
                        partners.retain(|p| *p != removed);
                    }
                }
                _ => {}
            }
            assert_lists_consistent(&world, &expected);
        }

        for handle in live.drain(..) {
            world.remove_convex(handle);
        }
        assert_eq!(world.state_count(), 0);
        let ((states_live, _), (working_live, _)) = world.pool_usage();
        assert_eq!(states_live, 0);
        assert_eq!(working_live, 0);
    }

    #[test]
    fn removed_convex_leaves_no_dangling_references() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let a = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let b = world.add_convex(cube_at(&mut ecs, Vec3::X, CollisionLayer::Default));
        let c = world.add_convex(cube_at(&mut ecs, Vec3::Y, CollisionLayer::Default));

        world.add_to_working_list(a, b).expect("add");
        world.add_to_working_list(c, b).expect("add");
        world.add_to_working_list(b, a).expect("add");
        let state = world.register_pair(a, b).expect("register");
        world.register_pair(b, c).expect("register");

        world.remove_convex(b);
        assert!(world.convex(b).is_none());
        assert!(world.state(state).is_none());
        assert!(world.working_list(a).is_empty());
        assert!(world.working_list(c).is_empty());
        assert!(world.references(a).is_empty());
        assert_eq!(world.state_count(), 0);
        assert!(world.states_of(a).is_empty());
        assert!(world.states_of(c).is_empty());
        assert_eq!(
            world.distance(a, b, f32::MAX),
            Err(WorldError::UnknownConvex(b))
        );
    }

    #[test]
    fn self_pairs_are_rejected() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let a = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        assert_eq!(world.add_to_working_list(a, a), Err(WorldError::SelfPair(a)));
        assert_eq!(world.register_pair(a, a), Err(WorldError::SelfPair(a)));
    }

    #[test]
    fn working_list_respects_box_and_mask() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mover = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Player));
        let near_wall = world.add_convex(cube_at(
            &mut ecs,
            Vec3::new(1.5, 0.0, 0.0),
            CollisionLayer::Environment,
        ));
        let near_enemy =
            world.add_convex(cube_at(&mut ecs, Vec3::new(0.0, 1.5, 0.0), CollisionLayer::Enemy));
        let far_wall = world.add_convex(cube_at(
            &mut ecs,
            Vec3::new(20.0, 0.0, 0.0),
            CollisionLayer::Environment,
        ));

        let query = Aabb::new(Vec3::splat(-2.0), Vec3::splat(2.0));
        world
            .update_working_list(mover, &query, CollisionLayer::Environment.bit())
            .expect("update");
        assert_eq!(world.working_list(mover), vec![near_wall]);

        let mask = CollisionLayer::Environment.bit() | CollisionLayer::Enemy.bit();
        world.update_working_list(mover, &query, mask).expect("update");
        assert_eq!(world.working_list(mover), vec![near_wall, near_enemy]);
        assert_eq!(world.references(near_enemy), vec![mover]);

        world
            .set_transform(near_wall, Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)), Vec3::ONE)
            .expect("set");
        world.update_working_list(mover, &query, mask).expect("update");
        assert_eq!(world.working_list(mover), vec![near_enemy]);
        assert!(world.references(near_wall).is_empty());
        assert!(world.references(far_wall).is_empty());
    }

    #[test]
    fn state_list_follows_working_list_and_bounds() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mover = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let other =
            world.add_convex(cube_at(&mut ecs, Vec3::new(1.8, 0.0, 0.0), CollisionLayer::Default));
        world.add_to_working_list(mover, other).expect("add");

        world
            .update_state_list(mover, &Mat4::IDENTITY, Vec3::ONE, None)
            .expect("update");
        assert_eq!(world.states_of(mover).len(), 1);
        assert_eq!(world.states_of(other).len(), 1);

        // A second update with nothing changed must not duplicate the state.
        world
            .update_state_list(mover, &Mat4::IDENTITY, Vec3::ONE, None)
            .expect("update");
        assert_eq!(world.state_count(), 1);

        let far = Mat4::from_translation(Vec3::new(-10.0, 0.0, 0.0));
        world.update_state_list(mover, &far, Vec3::ONE, None).expect("update");
        assert_eq!(world.state_count(), 0);

        // Sweeping back across the partner brings the state back.
        world
            .update_state_list(mover, &far, Vec3::ONE, Some(Vec3::new(12.0, 0.0, 0.0)))
            .expect("update");
        assert_eq!(world.state_count(), 1);
    }

    #[test]
    fn find_closest_state_picks_nearest_partner() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mover = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let near =
            world.add_convex(cube_at(&mut ecs, Vec3::new(1.5, 0.0, 0.0), CollisionLayer::Default));
        let far =
            world.add_convex(cube_at(&mut ecs, Vec3::new(0.0, 0.0, -1.8), CollisionLayer::Default));
        world.add_to_working_list(mover, far).expect("add");
        world.add_to_working_list(mover, near).expect("add");

        let (state, dist) = world
            .find_closest_state(mover, &Mat4::IDENTITY, Vec3::ONE, 5.0)
            .expect("query")
            .expect("a state within range");
        assert_relative_eq!(dist, 0.5, epsilon = 1e-3);
        let state = world.state(state).expect("live state");
        assert_eq!(state.shape_a(), mover);
        assert_eq!(state.shape_b(), near);

        assert_eq!(
            world
                .find_closest_state(mover, &Mat4::IDENTITY, Vec3::ONE, 0.1)
                .expect("query"),
            None
        );
    }

    #[test]
    fn find_closest_state_keeps_partner_exactly_at_dont_care_dist() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mover = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let other =
            world.add_convex(cube_at(&mut ecs, Vec3::new(1.5, 0.0, 0.0), CollisionLayer::Default));
        world.add_to_working_list(mover, other).expect("add");

        let gap = world.distance(mover, other, f32::MAX).expect("query");
        assert_relative_eq!(gap, 0.5, epsilon = 1e-3);

        let (state, dist) = world
            .find_closest_state(mover, &Mat4::IDENTITY, Vec3::ONE, gap)
            .expect("query")
            .expect("a partner exactly at the cut-off is kept");
        assert_eq!(dist, gap);
        assert_eq!(world.state(state).expect("live").shape_b(), other);
    }

    #[test]
    fn find_closest_state_orients_states_owned_by_partner() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mover = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let other =
            world.add_convex(cube_at(&mut ecs, Vec3::new(1.8, 0.0, 0.0), CollisionLayer::Default));
        let state = world.register_pair(other, mover).expect("register");

        let (found, dist) = world
            .find_closest_state(mover, &Mat4::IDENTITY, Vec3::ONE, 5.0)
            .expect("query")
            .expect("in range");
        assert_eq!(found, state);
        assert_relative_eq!(dist, 0.8, epsilon = 1e-3);
        assert_eq!(world.state(state).expect("live").shape_a(), mover);
    }

    #[test]
    fn collision_info_reports_touching_partners() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mover = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let wall_convex = cube_at(&mut ecs, Vec3::new(1.0005, 0.0, 0.0), CollisionLayer::Default);
        let wall_owner = wall_convex.owner();
        let wall = world.add_convex(wall_convex);
        let distant =
            world.add_convex(cube_at(&mut ecs, Vec3::new(0.0, 1.8, 0.0), CollisionLayer::Default));
        world.add_to_working_list(mover, wall).expect("add");
        world.add_to_working_list(mover, distant).expect("add");

        world
            .find_closest_state(mover, &Mat4::IDENTITY, Vec3::ONE, 5.0)
            .expect("query");

        let mut list = CollisionList::new();
        let complete = world
            .collision_info(mover, &Mat4::IDENTITY, Vec3::ONE, 0.01, &mut list)
            .expect("collision info");
        assert!(complete);
        assert_eq!(list.len(), 1);

        let info = &list.as_slice()[0];
        assert_eq!(info.object, wall_owner);
        assert_relative_eq!(info.point.x, 0.5, epsilon = 1e-3);
        assert_relative_eq!(info.normal.length(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn collision_list_is_bounded() {
        let mut list = CollisionList::new();
        let mut ecs = World::new();
        let object = ecs.spawn_empty().id();
        let info = CollisionInfo {
            point: Vec3::ZERO,
            normal: Vec3::X,
            object,
            distance: 0.0,
        };
        for _ in 0..MAX_COLLISIONS {
            assert!(list.push(info));
        }
        assert!(list.is_full());
        assert!(!list.push(info));
        assert_eq!(list.len(), MAX_COLLISIONS);
        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn parallel_distances_match_single_queries() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let mut rng = StdRng::seed_from_u64(5);
        let handles: Vec<ConvexHandle> = (0..16)
            .map(|i| {
                let owner = ecs.spawn_empty().id();
                let position = Vec3::new(
                    rng.random_range(-8.0..8.0),
                    rng.random_range(-8.0..8.0),
                    rng.random_range(-8.0..8.0),
                );
                let convex = if i % 2 == 0 {
                    Convex::new(owner, Sphere::new(0.75), CollisionLayer::Default)
                } else {
                    Convex::new(owner, BoxShape::cube(1.0), CollisionLayer::Default)
                };
                world.add_convex(convex.with_transform(Mat4::from_translation(position), Vec3::ONE))
            })
            .collect();
        for pair in handles.windows(2) {
            world.register_pair(pair[0], pair[1]).expect("register");
        }

        let results = world.distance_all_states(f32::MAX);
        assert_eq!(results.len(), handles.len() - 1);
        for (state, dist) in results {
            let state = world.state(state).expect("live");
            let single = world
                .distance(state.shape_a(), state.shape_b(), f32::MAX)
                .expect("query");
            assert_relative_eq!(dist, single, epsilon = 1e-4);
        }
    }

    #[test]
    fn one_shot_queries_use_stored_transforms() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let a = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let b = world.add_convex(cube_at(&mut ecs, Vec3::new(0.8, 0.0, 0.0), CollisionLayer::Default));
        assert_eq!(world.intersect(a, b), Ok(true));

        world
            .set_transform(b, Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)), Vec3::ONE)
            .expect("set");
        assert_eq!(world.intersect(a, b), Ok(false));
        let dist = world.distance(a, b, f32::MAX).expect("query");
        assert_relative_eq!(dist, 2.0, epsilon = 1e-3);
        assert_eq!(world.state_count(), 0);
    }

    #[test]
    fn settings_propagate_to_live_states() {
        let mut ecs = World::new();
        let mut world = CollisionWorld::default();
        let a = world.add_convex(cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default));
        let b = world.add_convex(cube_at(&mut ecs, Vec3::X * 3.0, CollisionLayer::Default));
        let state = world.register_pair(a, b).expect("register");

        let settings = GjkSettings {
            max_iterations: 40,
            ..GjkSettings::default()
        };
        world.set_settings(settings);
        assert_eq!(world.state(state).expect("live").settings().max_iterations, 40);
    }

    #[test]
    fn world_is_an_ecs_resource() {
        let mut ecs = World::new();
        let convex = cube_at(&mut ecs, Vec3::ZERO, CollisionLayer::Default);
        ecs.insert_resource(CollisionWorld::default());

        let handle = ecs.resource_mut::<CollisionWorld>().add_convex(convex);
        assert!(ecs.resource::<CollisionWorld>().convex(handle).is_some());
        assert_eq!(ecs.resource::<CollisionWorld>().irregularities(), 0);
    }
}
