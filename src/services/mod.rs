pub mod backup;
pub mod dispatcher;
pub mod monitor;
pub mod prober;
pub mod sampler;
pub mod scheduler;
pub mod state;
