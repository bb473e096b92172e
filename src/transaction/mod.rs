// Transaction bookkeeping and metadata locks

mod mdl;
mod state;

pub use mdl::{MdlContext, MdlDuration, MdlKey, MdlManager, MdlMode};
pub use state::{Boundary, IsolationLevel, TransactionState, XaState};
