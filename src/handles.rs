use slotmap::new_key_type;

new_key_type! {
    /// A convex registered in a `CollisionWorld`.
    pub struct ConvexHandle;
    /// A `GjkCollisionState` tracked by a `CollisionWorld`.
    pub struct StateHandle;
}
