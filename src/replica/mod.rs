//! Replicated entities and their build-time content
//!
//! A replica is identity plus an ordered stack of behaviors; prefabs and
//! scene definitions construct identical stacks on both peers so only state,
//! never structure, goes over the wire.

pub mod behavior;
pub mod id;
pub mod prefab;
pub mod replica;
pub mod scene;
pub mod view;

#[cfg(test)]
pub(crate) mod test_behaviors;
