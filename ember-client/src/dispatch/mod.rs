//! Operation dispatch: routing, retries and deadlines for single requests.

mod dispatcher;
mod options;
mod status;

pub use dispatcher::{Dispatcher, Operation};
pub use options::DispatchOptions;
