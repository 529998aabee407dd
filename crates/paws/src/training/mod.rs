//! Weak-supervision training: objectives, evaluation metrics, the joint
//! trainer with its stopping policy, and supervised pre-training of the
//! classifier on truth labels.

pub mod loss;
pub mod metrics;
pub mod supervised;
pub mod trainer;
