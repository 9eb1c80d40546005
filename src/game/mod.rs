pub mod constants;
pub mod reconcile;
pub mod spawner;
pub mod step;
pub mod world;
