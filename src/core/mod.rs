//! Core engine - cells, graph, planning, execution, state.

pub mod cell;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod state;
pub mod types;
