pub mod replay;

pub use replay::recover_unsettled_execution_ledger;
