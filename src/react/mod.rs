//! 编排层：TurnController、Router（含循环检测）、记忆更新处理器、回合主循环

pub mod controller;
pub mod loop_;
pub mod router;
pub mod update;

pub use controller::TurnController;
pub use loop_::{run_turn, TurnOutcome, TurnSession, DEFAULT_MAX_TURN_STEPS};
pub use router::{EndReason, LoopGuard, Route, Router};
pub use update::UpdateHandler;
