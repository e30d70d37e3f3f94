//! Serde model for plan YAML files
//!
//! Tasks, schedules, interrupt rules, state maps, and the tasklet unit of
//! scheduling. These are the on-disk contracts: the engine must write the
//! same shapes it reads.

pub mod interrupt;
pub mod schedule;
pub mod states;
pub mod task;
pub mod tasklet;
