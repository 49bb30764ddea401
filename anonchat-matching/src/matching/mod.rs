pub mod engine;
pub mod sweeper;
pub mod timers;

pub use engine::MatchmakingEngine;
