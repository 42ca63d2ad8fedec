//! 编排层：Planner、工具顺序约束、主循环

pub mod loop_;
pub mod ordering;
pub mod planner;

pub use loop_::{run_turn, ChatOutcome, ReactSession, TurnLimits};
pub use ordering::{OrderingGuard, OrderingPolicy, ToolFamily};
pub use planner::Planner;
