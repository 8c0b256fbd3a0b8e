//! The priority scheduler (E) and the queue actor (F) that binds it to the
//! outside world.

pub mod actor;
mod item;
mod priority;

pub use actor::{ActorMessage, QueueActorHandle, spawn};
pub use item::{AggregatedItem, GroupItem, InstanceItem, QueueItem};
