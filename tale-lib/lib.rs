//! Story persistence core: documents, branching history and editor
//! reconciliation on top of [`tale_core`].

pub mod change;
pub mod config;
pub mod document;
pub mod history;
pub mod legacy;
pub mod reconcile;

pub use crate::{
  change::{
    ChangeMap,
    HistoryStep,
  },
  config::Config,
  document::{
    Document,
    DocumentError,
  },
  history::{
    Direction,
    HistoryNodeId,
    HistoryTree,
  },
};
