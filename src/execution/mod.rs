//! Execution layer: translates approved option intents into per-leg orders
//! and closes the loop with a paper order router.

pub mod options_service;
pub mod paper_router;

pub use options_service::OptionExecutionService;
pub use paper_router::PaperOrderRouter;
